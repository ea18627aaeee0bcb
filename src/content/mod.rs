//! Content Records
//!
//! One `ContentRecord` per registered item. Status moves only along
//! `pending -> processing -> {confirmed | failed}`, plus edits that send any
//! record back to `pending`. Every mutation goes through
//! [`ContentRecord::apply`], which refuses anything off that graph.

pub mod store;

use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::AnchorError;

pub use store::{ContentStore, MemoryContentStore, SledContentStore};

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_BODY_CHARS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnChainStatus {
    Pending,
    Processing,
    Confirmed,
    Failed,
}

impl fmt::Display for OnChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OnChainStatus::Pending => "pending",
            OnChainStatus::Processing => "processing",
            OnChainStatus::Confirmed => "confirmed",
            OnChainStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A superseded on-chain anchoring of an earlier version of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalReference {
    pub version: u32,
    pub fingerprint: B256,
    pub status: OnChainStatus,
    pub transaction_ref: Option<String>,
    pub block_ref: Option<u64>,
    pub superseded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRecord {
    pub id: String,
    pub owner_identity: String,
    pub title: String,
    pub body: String,
    pub fingerprint: B256,
    pub version: u32,
    pub on_chain_status: OnChainStatus,
    pub transaction_ref: Option<String>,
    pub block_ref: Option<u64>,
    pub operation_hash: Option<B256>,
    pub sponsored: Option<bool>,
    pub gas_used: Option<u64>,
    pub retry_attempt: u32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<HistoricalReference>,
}

/// What a successful anchoring leaves on the record.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub transaction_ref: String,
    pub block_ref: Option<u64>,
    pub operation_hash: Option<B256>,
    pub sponsored: Option<bool>,
    pub gas_used: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusChange {
    /// pending -> processing
    BeginProcessing,
    /// processing -> confirmed
    Confirm(Confirmation),
    /// processing -> failed
    Fail { error: String },
    /// Outcome unknown; stays processing until verified.
    Uncertain { error: String },
    /// processing -> processing with one more attempt and a fresh clock
    Retry,
    /// any -> pending when the fingerprint changes
    Edit { title: String, body: String },
}

impl StatusChange {
    fn name(&self) -> &'static str {
        match self {
            StatusChange::BeginProcessing => "processing",
            StatusChange::Confirm(_) => "confirmed",
            StatusChange::Fail { .. } => "failed",
            StatusChange::Uncertain { .. } => "processing (uncertain)",
            StatusChange::Retry => "processing (retry)",
            StatusChange::Edit { .. } => "pending (edit)",
        }
    }
}

/// Snapshot a guarded update must still match to be applied. A record that
/// moved on (edited, retried or settled by another path) rejects stale
/// outcomes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordGuard {
    pub status: OnChainStatus,
    pub version: u32,
    pub processing_started_at: Option<DateTime<Utc>>,
}

impl RecordGuard {
    pub fn matches(&self, record: &ContentRecord) -> bool {
        record.on_chain_status == self.status
            && record.version == self.version
            && record.processing_started_at == self.processing_started_at
    }
}

impl ContentRecord {
    pub fn new(owner_identity: &str, title: &str, body: &str, now: DateTime<Utc>) -> Result<Self, AnchorError> {
        validate_content(title, body)?;
        if owner_identity.is_empty() {
            return Err(AnchorError::InvalidContent("owner identity is required".to_string()));
        }
        Ok(Self {
            id: generate_record_id(owner_identity, now),
            owner_identity: owner_identity.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            fingerprint: fingerprint(title, body),
            version: 1,
            on_chain_status: OnChainStatus::Pending,
            transaction_ref: None,
            block_ref: None,
            operation_hash: None,
            sponsored: None,
            gas_used: None,
            retry_attempt: 0,
            processing_started_at: None,
            confirmed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        })
    }

    pub fn guard(&self) -> RecordGuard {
        RecordGuard {
            status: self.on_chain_status,
            version: self.version,
            processing_started_at: self.processing_started_at,
        }
    }

    /// Registry key of this record.
    pub fn note_id(&self) -> B256 {
        note_id(&self.id)
    }

    /// Applies one transition. Returns `Ok(false)` when the change is a
    /// no-op (an edit that leaves the fingerprint unchanged).
    pub fn apply(&mut self, change: StatusChange, now: DateTime<Utc>) -> Result<bool, AnchorError> {
        use OnChainStatus::*;

        match (self.on_chain_status, change) {
            (Pending, StatusChange::BeginProcessing) => {
                self.on_chain_status = Processing;
                self.processing_started_at = Some(now);
                self.last_error = None;
            }
            (Processing, StatusChange::Confirm(confirmation)) => {
                self.on_chain_status = Confirmed;
                self.transaction_ref = Some(confirmation.transaction_ref);
                self.block_ref = confirmation.block_ref;
                self.operation_hash = confirmation.operation_hash;
                self.sponsored = confirmation.sponsored;
                self.gas_used = confirmation.gas_used;
                self.confirmed_at = Some(now);
                self.last_error = None;
            }
            (Processing, StatusChange::Fail { error }) => {
                self.on_chain_status = Failed;
                self.last_error = Some(error);
            }
            (Processing, StatusChange::Uncertain { error }) => {
                self.last_error = Some(error);
            }
            (Processing, StatusChange::Retry) => {
                self.retry_attempt += 1;
                self.processing_started_at = Some(now);
            }
            (_, StatusChange::Edit { title, body }) => {
                validate_content(&title, &body)?;
                let next = fingerprint(&title, &body);
                if next == self.fingerprint {
                    return Ok(false);
                }
                self.history.push(HistoricalReference {
                    version: self.version,
                    fingerprint: self.fingerprint,
                    status: self.on_chain_status,
                    transaction_ref: self.transaction_ref.take(),
                    block_ref: self.block_ref.take(),
                    superseded_at: now,
                });
                self.title = title;
                self.body = body;
                self.fingerprint = next;
                self.version += 1;
                self.on_chain_status = Pending;
                self.retry_attempt = 0;
                self.operation_hash = None;
                self.sponsored = None;
                self.gas_used = None;
                self.processing_started_at = None;
                self.confirmed_at = None;
                self.last_error = None;
            }
            (from, change) => {
                return Err(AnchorError::IllegalTransition {
                    from: from.to_string(),
                    to: change.name().to_string(),
                });
            }
        }
        self.updated_at = now;
        Ok(true)
    }
}

/// SHA-256 of `"{title}|{body}"`.
pub fn fingerprint(title: &str, body: &str) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    hasher.update(body.as_bytes());
    B256::from_slice(&hasher.finalize())
}

/// Registry key for a record id: SHA-256 of the id string.
pub fn note_id(record_id: &str) -> B256 {
    B256::from_slice(&Sha256::digest(record_id.as_bytes()))
}

pub fn generate_record_id(owner_identity: &str, now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(9)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("note_{}_{}_{}", owner_identity, now.timestamp_millis(), suffix)
}

pub fn validate_content(title: &str, body: &str) -> Result<(), AnchorError> {
    if title.trim().is_empty() || body.trim().is_empty() {
        return Err(AnchorError::InvalidContent("title and body are required".to_string()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(AnchorError::InvalidContent(format!(
            "title must be {} characters or less",
            MAX_TITLE_CHARS
        )));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(AnchorError::InvalidContent(format!(
            "body must be {} characters or less",
            MAX_BODY_CHARS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ContentRecord {
        ContentRecord::new("u1", "Title", "abc123", Utc::now()).unwrap()
    }

    fn confirmation() -> Confirmation {
        Confirmation {
            transaction_ref: "0xfeed".to_string(),
            block_ref: Some(12),
            operation_hash: Some(B256::repeat_byte(1)),
            sponsored: Some(true),
            gas_used: Some(21_000),
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint("a", "b"), fingerprint("a", "b"));
        assert_ne!(fingerprint("a", "b"), fingerprint("a|", "b"));
        let expected = Sha256::digest(b"a|b");
        assert_eq!(fingerprint("a", "b").as_slice(), expected.as_slice());
    }

    #[test]
    fn test_record_id_format() {
        let id = generate_record_id("u1", Utc::now());
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0], "note");
        assert_eq!(parts[1], "u1");
        assert_eq!(parts[3].len(), 9);
    }

    #[test]
    fn test_validation_limits() {
        assert!(validate_content("t", "b").is_ok());
        assert!(validate_content("", "b").is_err());
        assert!(validate_content("t", "   ").is_err());
        assert!(validate_content(&"x".repeat(201), "b").is_err());
        assert!(validate_content("t", &"x".repeat(10_001)).is_err());
    }

    #[test]
    fn test_confirm_requires_processing() {
        let mut r = record();
        let err = r.apply(StatusChange::Confirm(confirmation()), Utc::now()).unwrap_err();
        assert!(matches!(err, AnchorError::IllegalTransition { .. }));
        assert_eq!(r.on_chain_status, OnChainStatus::Pending);

        r.apply(StatusChange::BeginProcessing, Utc::now()).unwrap();
        r.apply(StatusChange::Confirm(confirmation()), Utc::now()).unwrap();
        assert_eq!(r.on_chain_status, OnChainStatus::Confirmed);
        assert_eq!(r.transaction_ref.as_deref(), Some("0xfeed"));
    }

    #[test]
    fn test_terminal_states_reject_retry() {
        let mut r = record();
        r.apply(StatusChange::BeginProcessing, Utc::now()).unwrap();
        r.apply(StatusChange::Fail { error: "AA23".into() }, Utc::now()).unwrap();
        assert!(r.apply(StatusChange::Retry, Utc::now()).is_err());
        assert!(r.apply(StatusChange::BeginProcessing, Utc::now()).is_err());
        assert_eq!(r.last_error.as_deref(), Some("AA23"));
    }

    #[test]
    fn test_retry_bumps_attempt_and_clock() {
        let mut r = record();
        let t0 = Utc::now();
        r.apply(StatusChange::BeginProcessing, t0).unwrap();
        let t1 = t0 + chrono::Duration::minutes(6);
        r.apply(StatusChange::Retry, t1).unwrap();
        assert_eq!(r.retry_attempt, 1);
        assert_eq!(r.processing_started_at, Some(t1));
    }

    #[test]
    fn test_edit_after_confirmation_keeps_history() {
        let mut r = record();
        r.apply(StatusChange::BeginProcessing, Utc::now()).unwrap();
        r.apply(StatusChange::Retry, Utc::now()).unwrap();
        r.apply(StatusChange::Confirm(confirmation()), Utc::now()).unwrap();
        let old_fingerprint = r.fingerprint;

        let changed = r
            .apply(
                StatusChange::Edit { title: "Title".into(), body: "changed".into() },
                Utc::now(),
            )
            .unwrap();
        assert!(changed);
        assert_eq!(r.on_chain_status, OnChainStatus::Pending);
        assert_eq!(r.version, 2);
        assert_eq!(r.retry_attempt, 0);
        assert!(r.transaction_ref.is_none());
        assert_eq!(r.history.len(), 1);
        assert_eq!(r.history[0].fingerprint, old_fingerprint);
        assert_eq!(r.history[0].transaction_ref.as_deref(), Some("0xfeed"));
    }

    #[test]
    fn test_edit_with_same_content_is_noop() {
        let mut r = record();
        let changed = r
            .apply(StatusChange::Edit { title: "Title".into(), body: "abc123".into() }, Utc::now())
            .unwrap();
        assert!(!changed);
        assert_eq!(r.version, 1);
    }

    #[test]
    fn test_guard_detects_moved_record() {
        let mut r = record();
        r.apply(StatusChange::BeginProcessing, Utc::now()).unwrap();
        let guard = r.guard();
        assert!(guard.matches(&r));
        r.apply(StatusChange::Retry, Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert!(!guard.matches(&r));
    }
}
