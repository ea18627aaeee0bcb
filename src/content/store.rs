use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

use super::{ContentRecord, OnChainStatus, RecordGuard, StatusChange};
use crate::error::AnchorError;

/// Result of a guarded update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(ContentRecord),
    /// The change was legal but changed nothing.
    Unchanged(ContentRecord),
    /// The record no longer matches the guard; nothing was written.
    Stale(ContentRecord),
}

impl UpdateOutcome {
    pub fn record(&self) -> &ContentRecord {
        match self {
            UpdateOutcome::Applied(r) | UpdateOutcome::Unchanged(r) | UpdateOutcome::Stale(r) => r,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }
}

/// Durable home of content records.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn insert(&self, record: &ContentRecord) -> Result<(), AnchorError>;
    async fn get(&self, id: &str) -> Result<Option<ContentRecord>, AnchorError>;
    async fn list_by_status(&self, status: OnChainStatus) -> Result<Vec<ContentRecord>, AnchorError>;
    async fn list_by_owner(&self, owner: &str) -> Result<Vec<ContentRecord>, AnchorError>;
    /// Atomically applies `change` if the stored record still matches `guard`
    /// (no guard means unconditional).
    async fn update(
        &self,
        id: &str,
        guard: Option<RecordGuard>,
        change: StatusChange,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, AnchorError>;
}

fn apply_guarded(
    mut record: ContentRecord,
    guard: Option<RecordGuard>,
    change: StatusChange,
    now: DateTime<Utc>,
) -> Result<UpdateOutcome, AnchorError> {
    if let Some(guard) = guard {
        if !guard.matches(&record) {
            return Ok(UpdateOutcome::Stale(record));
        }
    }
    if record.apply(change, now)? {
        Ok(UpdateOutcome::Applied(record))
    } else {
        Ok(UpdateOutcome::Unchanged(record))
    }
}

/// Process-local store; records are lost on restart.
#[derive(Default)]
pub struct MemoryContentStore {
    records: RwLock<HashMap<String, ContentRecord>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn insert(&self, record: &ContentRecord) -> Result<(), AnchorError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(AnchorError::Storage(format!("record {} already exists", record.id)));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ContentRecord>, AnchorError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list_by_status(&self, status: OnChainStatus) -> Result<Vec<ContentRecord>, AnchorError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.on_chain_status == status)
            .cloned()
            .collect())
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<ContentRecord>, AnchorError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.owner_identity == owner)
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        id: &str,
        guard: Option<RecordGuard>,
        change: StatusChange,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, AnchorError> {
        let mut records = self.records.write().await;
        let current = records
            .get(id)
            .cloned()
            .ok_or_else(|| AnchorError::NotFound(id.to_string()))?;
        let outcome = apply_guarded(current, guard, change, now)?;
        if let UpdateOutcome::Applied(record) = &outcome {
            records.insert(id.to_string(), record.clone());
        }
        Ok(outcome)
    }
}

/// Sled-backed store. Records are bincode-encoded under `content:{id}`.
pub struct SledContentStore {
    db: sled::Db,
}

impl SledContentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AnchorError> {
        let db = sled::open(path.as_ref()).map_err(storage_error)?;
        info!("💾 Content store opened at {}", path.as_ref().display());
        Ok(Self { db })
    }

    fn key(id: &str) -> String {
        format!("content:{}", id)
    }

    fn scan<F>(&self, keep: F) -> Result<Vec<ContentRecord>, AnchorError>
    where
        F: Fn(&ContentRecord) -> bool,
    {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(b"content:") {
            let (_, bytes) = entry.map_err(storage_error)?;
            let record: ContentRecord = decode(&bytes)?;
            if keep(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ContentStore for SledContentStore {
    async fn insert(&self, record: &ContentRecord) -> Result<(), AnchorError> {
        let bytes = encode(record)?;
        self.db
            .compare_and_swap(Self::key(&record.id), None::<&[u8]>, Some(bytes))
            .map_err(storage_error)?
            .map_err(|_| AnchorError::Storage(format!("record {} already exists", record.id)))?;
        self.db.flush_async().await.map_err(storage_error)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ContentRecord>, AnchorError> {
        match self.db.get(Self::key(id)).map_err(storage_error)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_by_status(&self, status: OnChainStatus) -> Result<Vec<ContentRecord>, AnchorError> {
        self.scan(|r| r.on_chain_status == status)
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<ContentRecord>, AnchorError> {
        self.scan(|r| r.owner_identity == owner)
    }

    async fn update(
        &self,
        id: &str,
        guard: Option<RecordGuard>,
        change: StatusChange,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, AnchorError> {
        let key = Self::key(id);
        loop {
            let old = self
                .db
                .get(&key)
                .map_err(storage_error)?
                .ok_or_else(|| AnchorError::NotFound(id.to_string()))?;
            let current: ContentRecord = decode(&old)?;

            let outcome = apply_guarded(current, guard, change.clone(), now)?;
            let UpdateOutcome::Applied(record) = &outcome else {
                return Ok(outcome);
            };

            let swapped = self
                .db
                .compare_and_swap(&key, Some(old), Some(encode(record)?))
                .map_err(storage_error)?;
            // lost a race with another writer; re-read and re-check the guard
            if swapped.is_ok() {
                self.db.flush_async().await.map_err(storage_error)?;
                return Ok(outcome);
            }
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, AnchorError> {
    bincode::serialize(value).map_err(|e| AnchorError::Storage(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, AnchorError> {
    bincode::deserialize(bytes).map_err(|e| AnchorError::Storage(e.to_string()))
}

fn storage_error(e: sled::Error) -> AnchorError {
    AnchorError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: &str) -> ContentRecord {
        ContentRecord::new(owner, "Title", "Body", Utc::now()).unwrap()
    }

    async fn exercise(store: &dyn ContentStore) {
        let r = record("u1");
        store.insert(&r).await.unwrap();
        assert!(store.insert(&r).await.is_err());
        store.insert(&record("u2")).await.unwrap();

        assert_eq!(store.get(&r.id).await.unwrap().unwrap(), r);
        assert!(store.get("missing").await.unwrap().is_none());
        assert_eq!(store.list_by_owner("u1").await.unwrap().len(), 1);
        assert_eq!(store.list_by_status(OnChainStatus::Pending).await.unwrap().len(), 2);

        let guard = r.guard();
        let outcome = store
            .update(&r.id, Some(guard), StatusChange::BeginProcessing, Utc::now())
            .await
            .unwrap();
        assert!(outcome.is_applied());
        assert_eq!(
            store.get(&r.id).await.unwrap().unwrap().on_chain_status,
            OnChainStatus::Processing
        );

        // the same guard is now stale
        let stale = store
            .update(&r.id, Some(guard), StatusChange::BeginProcessing, Utc::now())
            .await
            .unwrap();
        assert!(matches!(stale, UpdateOutcome::Stale(_)));

        let err = store
            .update("missing", None, StatusChange::Retry, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AnchorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryContentStore::new()).await;
    }

    #[tokio::test]
    async fn test_sled_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledContentStore::open(dir.path().join("db")).unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let r = record("u1");
        {
            let store = SledContentStore::open(&path).unwrap();
            store.insert(&r).await.unwrap();
        }
        let store = SledContentStore::open(&path).unwrap();
        assert_eq!(store.get(&r.id).await.unwrap().unwrap().id, r.id);
    }
}
