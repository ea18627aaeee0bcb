//! Status Reconciler
//!
//! Owns every status transition of a content record after creation:
//! registration (`pending -> processing -> confirmed | failed`) and the
//! verify-then-maybe-retry step that settles records left in `processing`.
//! The periodic sweep and on-demand checks both go through
//! [`StatusReconciler::verify_and_maybe_retry`], so they converge on the same
//! terminal state.

use alloy_primitives::{Address, Bytes, B256};
use alloy_sol_types::SolCall;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::{Registry, RegistryEntry};
use crate::config::ReconcilerConfig;
use crate::content::store::UpdateOutcome;
use crate::content::{Confirmation, ContentRecord, ContentStore, OnChainStatus, StatusChange};
use crate::error::AnchorError;
use crate::operation::abi::{registerNoteCall, updateNoteCall};
use crate::submission::{SubmissionPipeline, SubmissionRequest};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilerPolicy {
    /// A processing record becomes eligible for verification at this age.
    pub stuck_window: chrono::Duration,
    /// No retries once the current attempt is older than this. Measured per
    /// attempt: a retry restarts the clock.
    pub give_up_after: chrono::Duration,
    pub max_retries: u32,
}

impl From<&ReconcilerConfig> for ReconcilerPolicy {
    fn from(config: &ReconcilerConfig) -> Self {
        Self {
            stuck_window: chrono::Duration::seconds(config.stuck_window_secs as i64),
            give_up_after: chrono::Duration::seconds(config.give_up_after_secs as i64),
            max_retries: config.max_retries,
        }
    }
}

impl Default for ReconcilerPolicy {
    fn default() -> Self {
        Self::from(&ReconcilerConfig::default())
    }
}

/// What a verify-then-maybe-retry pass did to one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ReconcileAction {
    /// Not processing; nothing to do.
    Skipped { status: OnChainStatus },
    NotYetStuck,
    /// Found on chain; confirmed without resubmitting.
    Recovered,
    /// Resubmitted; `status` is where the new attempt left the record.
    Retried { status: OnChainStatus },
    Failed,
    /// Another path changed the record first.
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub examined: usize,
    pub recovered: usize,
    pub retried: usize,
    pub failed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub verified: bool,
    pub on_chain_fingerprint: Option<B256>,
    pub owner: Option<Address>,
    pub timestamp: Option<u64>,
}

pub struct StatusReconciler {
    store: Arc<dyn ContentStore>,
    registry: Arc<dyn Registry>,
    pipeline: Arc<SubmissionPipeline>,
    registry_address: Address,
    policy: ReconcilerPolicy,
}

impl StatusReconciler {
    pub fn new(
        store: Arc<dyn ContentStore>,
        registry: Arc<dyn Registry>,
        pipeline: Arc<SubmissionPipeline>,
        registry_address: Address,
        policy: ReconcilerPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            pipeline,
            registry_address,
            policy,
        }
    }

    /// Moves a pending record to processing and runs one anchoring attempt.
    pub async fn register(&self, id: &str) -> Result<ContentRecord, AnchorError> {
        let record = self.load(id).await?;
        let now = Utc::now();
        match self
            .store
            .update(id, Some(record.guard()), StatusChange::BeginProcessing, now)
            .await?
        {
            UpdateOutcome::Applied(processing) => {
                info!("📝 Registering {} (v{})", processing.id, processing.version);
                self.run_attempt(processing, now).await
            }
            other => Ok(other.record().clone()),
        }
    }

    /// Settles a record stuck in processing. Records that are not
    /// processing, or not yet older than the stuck window, are left alone.
    pub async fn verify_and_maybe_retry(&self, id: &str, now: DateTime<Utc>) -> Result<ReconcileAction, AnchorError> {
        let record = self.load(id).await?;
        if record.on_chain_status != OnChainStatus::Processing {
            return Ok(ReconcileAction::Skipped {
                status: record.on_chain_status,
            });
        }

        let age = record
            .processing_started_at
            .map(|started| now - started)
            .unwrap_or(self.policy.give_up_after);
        if age < self.policy.stuck_window {
            return Ok(ReconcileAction::NotYetStuck);
        }

        let guard = record.guard();
        let entry = self.registry.get(record.note_id()).await?;

        if anchors(&entry, &record) {
            let confirmation = recovered_confirmation(&record, &entry);
            let outcome = self
                .store
                .update(id, Some(guard), StatusChange::Confirm(confirmation), now)
                .await?;
            if !outcome.is_applied() {
                return Ok(ReconcileAction::Stale);
            }
            info!("🔁 Recovered {}: found on chain at {}", id, entry.timestamp);
            return Ok(ReconcileAction::Recovered);
        }

        if age < self.policy.give_up_after && record.retry_attempt < self.policy.max_retries {
            let outcome = self.store.update(id, Some(guard), StatusChange::Retry, now).await?;
            let UpdateOutcome::Applied(retrying) = outcome else {
                return Ok(ReconcileAction::Stale);
            };
            warn!(
                "🔄 {} not on chain after {}s, retry {}/{}",
                id,
                age.num_seconds(),
                retrying.retry_attempt,
                self.policy.max_retries
            );
            let settled = self.run_attempt(retrying, now).await?;
            return Ok(ReconcileAction::Retried {
                status: settled.on_chain_status,
            });
        }

        let reason = AnchorError::Permanent(format!(
            "not found on chain after {} retries{}",
            record.retry_attempt,
            record
                .last_error
                .as_deref()
                .map(|e| format!("; last error: {}", e))
                .unwrap_or_default()
        ));
        let outcome = self
            .store
            .update(id, Some(guard), StatusChange::Fail { error: reason.to_string() }, now)
            .await?;
        if !outcome.is_applied() {
            return Ok(ReconcileAction::Stale);
        }
        error!("❌ Giving up on {}: {}", id, reason);
        Ok(ReconcileAction::Failed)
    }

    /// Runs one verification pass over every processing record, oldest first,
    /// one at a time.
    pub async fn sweep_stuck(&self) -> Result<SweepReport, AnchorError> {
        self.sweep_stuck_at(Utc::now()).await
    }

    pub async fn sweep_stuck_at(&self, now: DateTime<Utc>) -> Result<SweepReport, AnchorError> {
        let mut records = self.store.list_by_status(OnChainStatus::Processing).await?;
        records.sort_by_key(|r| r.processing_started_at);

        let mut report = SweepReport::default();
        for record in records {
            report.examined += 1;
            match self.verify_and_maybe_retry(&record.id, now).await {
                Ok(ReconcileAction::Recovered) => report.recovered += 1,
                Ok(ReconcileAction::Retried { .. }) => report.retried += 1,
                Ok(ReconcileAction::Failed) => report.failed += 1,
                Ok(action) => debug!("Sweep left {} as is: {:?}", record.id, action),
                Err(e) => {
                    warn!("Sweep could not check {}: {}", record.id, e);
                    report.errors += 1;
                }
            }
        }
        if report.recovered + report.retried + report.failed > 0 {
            info!(
                "🧹 Sweep: {} examined, {} recovered, {} retried, {} failed",
                report.examined, report.recovered, report.retried, report.failed
            );
        }
        Ok(report)
    }

    /// Compares the registry entry for a record id against a fingerprint.
    pub async fn verify_content(&self, id: &str, expected: B256) -> Result<VerificationResult, AnchorError> {
        let entry = self.registry.get(crate::content::note_id(id)).await?;
        if !entry.exists {
            return Ok(VerificationResult {
                verified: false,
                on_chain_fingerprint: None,
                owner: None,
                timestamp: None,
            });
        }
        Ok(VerificationResult {
            verified: entry.fingerprint == expected,
            on_chain_fingerprint: Some(entry.fingerprint),
            owner: Some(entry.owner),
            timestamp: Some(entry.timestamp),
        })
    }

    /// Sweeps on a fixed interval until `stop` flips to true.
    pub async fn run(self: Arc<Self>, interval: std::time::Duration, mut stop: watch::Receiver<bool>) {
        info!("🧹 Stuck-record sweep every {:?}", interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_stuck().await {
                        error!("Sweep failed: {}", e);
                    }
                }
                _ = stop.changed() => {
                    info!("🛑 Sweep loop stopped");
                    return;
                }
            }
        }
    }

    /// One anchoring attempt for a record already in processing. The outcome
    /// is written only if the record has not moved on meanwhile.
    async fn run_attempt(&self, record: ContentRecord, now: DateTime<Utc>) -> Result<ContentRecord, AnchorError> {
        let guard = record.guard();
        let change = match self.attempt(&record).await {
            Ok(confirmation) => StatusChange::Confirm(confirmation),
            Err(e) if e.is_uncertain() => {
                warn!("⚠️ Outcome for {} uncertain: {}", record.id, e);
                StatusChange::Uncertain { error: e.to_string() }
            }
            Err(e) => {
                error!("❌ Anchoring {} failed: {}", record.id, e);
                StatusChange::Fail { error: e.to_string() }
            }
        };

        let outcome = self.store.update(&record.id, Some(guard), change, now).await?;
        if let UpdateOutcome::Stale(current) = &outcome {
            info!(
                "Discarding stale outcome for {} (now {} v{})",
                current.id, current.on_chain_status, current.version
            );
        }
        Ok(outcome.record().clone())
    }

    async fn attempt(&self, record: &ContentRecord) -> Result<Confirmation, AnchorError> {
        let note_id = record.note_id();
        let entry = self.registry.get(note_id).await?;
        if anchors(&entry, record) {
            info!("Record {} already on chain, skipping submission", record.id);
            return Ok(recovered_confirmation(record, &entry));
        }

        let payload: Bytes = if entry.exists {
            updateNoteCall {
                noteId: note_id,
                newNoteHash: record.fingerprint,
            }
            .abi_encode()
            .into()
        } else {
            registerNoteCall {
                noteId: note_id,
                noteHash: record.fingerprint,
            }
            .abi_encode()
            .into()
        };

        let receipt = self
            .pipeline
            .submit(&SubmissionRequest {
                identity: record.owner_identity.clone(),
                target: self.registry_address,
                payload,
            })
            .await?;

        Ok(Confirmation {
            transaction_ref: receipt.transaction_ref.to_string(),
            block_ref: Some(receipt.block_ref),
            operation_hash: Some(receipt.operation_hash),
            sponsored: Some(receipt.sponsored),
            gas_used: Some(receipt.gas_used),
        })
    }

    async fn load(&self, id: &str) -> Result<ContentRecord, AnchorError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AnchorError::NotFound(id.to_string()))
    }
}

fn anchors(entry: &RegistryEntry, record: &ContentRecord) -> bool {
    entry.exists && entry.fingerprint == record.fingerprint
}

/// Confirmation for a record found on chain without a local receipt.
fn recovered_confirmation(record: &ContentRecord, entry: &RegistryEntry) -> Confirmation {
    Confirmation {
        transaction_ref: record
            .transaction_ref
            .clone()
            .unwrap_or_else(|| format!("registry:{}@{}", record.note_id(), entry.timestamp)),
        block_ref: record.block_ref,
        operation_hash: record.operation_hash,
        sponsored: record.sponsored,
        gas_used: record.gas_used,
    }
}
