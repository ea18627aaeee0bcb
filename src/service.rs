//! Operations exposed to callers (RPC handlers and the CLI go through here).

use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::account::AccountInfo;
use crate::chain::{ChainHandles, NativeLedger, NetworkInfo, TransactionStatus};
use crate::config::AnchorConfig;
use crate::content::{ContentRecord, ContentStore, OnChainStatus, StatusChange};
use crate::error::AnchorError;
use crate::monitor::{SponsorHealth, SponsorMonitor, TopUpReport};
use crate::reconciler::{ReconcileAction, ReconcilerPolicy, StatusReconciler, SweepReport, VerificationResult};
use crate::submission::SubmissionPipeline;

pub const MAX_PAGE_SIZE: usize = 100;

/// Returned as soon as a registration is accepted; the outcome lands in the
/// record's status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub id: String,
    pub status: OnChainStatus,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPage {
    pub items: Vec<ContentRecord>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

pub struct AnchorService {
    store: Arc<dyn ContentStore>,
    pipeline: Arc<SubmissionPipeline>,
    reconciler: Arc<StatusReconciler>,
    monitor: Arc<SponsorMonitor>,
    ledger: Arc<dyn NativeLedger>,
}

impl AnchorService {
    pub fn new(store: Arc<dyn ContentStore>, handles: &ChainHandles, config: &AnchorConfig) -> Result<Self, AnchorError> {
        let pipeline = Arc::new(SubmissionPipeline::from_handles(handles, &config.submission)?);
        Self::from_parts(store, pipeline, handles, config)
    }

    /// Wires the service around an already-built pipeline.
    pub fn from_parts(
        store: Arc<dyn ContentStore>,
        pipeline: Arc<SubmissionPipeline>,
        handles: &ChainHandles,
        config: &AnchorConfig,
    ) -> Result<Self, AnchorError> {
        let reconciler = Arc::new(StatusReconciler::new(
            store.clone(),
            handles.registry.clone(),
            pipeline.clone(),
            handles.addresses.registry,
            ReconcilerPolicy::from(&config.reconciler),
        ));
        let monitor = Arc::new(SponsorMonitor::new(handles.sponsor.clone(), &config.monitor)?);
        Ok(Self {
            store,
            pipeline,
            reconciler,
            monitor,
            ledger: handles.ledger.clone(),
        })
    }

    pub fn reconciler(&self) -> Arc<StatusReconciler> {
        self.reconciler.clone()
    }

    pub fn monitor(&self) -> Arc<SponsorMonitor> {
        self.monitor.clone()
    }

    /// Creates a record and starts anchoring it.
    pub async fn submit_content(
        &self,
        owner: &str,
        title: &str,
        body: &str,
    ) -> Result<(Acknowledgement, JoinHandle<()>), AnchorError> {
        let record = ContentRecord::new(owner, title, body, Utc::now())?;
        self.store.insert(&record).await?;
        info!("🗒️ Stored {} for {}", record.id, owner);
        self.register_content(&record.id).await
    }

    /// Accepts a pending record for anchoring and returns at once. The
    /// registration itself runs on its own task.
    pub async fn register_content(&self, id: &str) -> Result<(Acknowledgement, JoinHandle<()>), AnchorError> {
        let record = self.get_content(id).await?;
        if record.on_chain_status != OnChainStatus::Pending {
            return Err(AnchorError::IllegalTransition {
                from: record.on_chain_status.to_string(),
                to: OnChainStatus::Processing.to_string(),
            });
        }

        let reconciler = self.reconciler.clone();
        let task_id = record.id.clone();
        let handle = tokio::spawn(async move {
            match reconciler.register(&task_id).await {
                Ok(settled) => info!("{} is {}", settled.id, settled.on_chain_status),
                Err(e) => error!("❌ Registration of {} aborted: {}", task_id, e),
            }
        });

        Ok((
            Acknowledgement {
                id: record.id,
                status: record.on_chain_status,
                accepted_at: Utc::now(),
            },
            handle,
        ))
    }

    /// Replaces title and body. A changed fingerprint sends the record back
    /// to pending; the earlier on-chain reference moves to its history.
    pub async fn edit_content(&self, id: &str, title: &str, body: &str) -> Result<ContentRecord, AnchorError> {
        let change = StatusChange::Edit {
            title: title.to_string(),
            body: body.to_string(),
        };
        let outcome = self.store.update(id, None, change, Utc::now()).await?;
        let record = outcome.record().clone();
        if outcome.is_applied() {
            info!("✏️ {} edited, now v{} and pending", record.id, record.version);
        }
        Ok(record)
    }

    pub async fn get_content(&self, id: &str) -> Result<ContentRecord, AnchorError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AnchorError::NotFound(id.to_string()))
    }

    /// Newest first. `page` starts at 1.
    pub async fn list_content(&self, owner: &str, page: usize, limit: usize) -> Result<ContentPage, AnchorError> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut records = self.store.list_by_owner(owner).await?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        let total = records.len();
        let items = records.into_iter().skip((page - 1) * limit).take(limit).collect();
        Ok(ContentPage { items, page, limit, total })
    }

    pub async fn verify_content(&self, id: &str, expected: B256) -> Result<VerificationResult, AnchorError> {
        self.reconciler.verify_content(id, expected).await
    }

    pub async fn check_sponsor_health(&self) -> SponsorHealth {
        self.monitor.health().await
    }

    pub async fn fund_sponsor(&self) -> Result<TopUpReport, AnchorError> {
        self.monitor.check_and_fund().await
    }

    pub async fn sweep_stuck(&self) -> Result<SweepReport, AnchorError> {
        self.reconciler.sweep_stuck().await
    }

    /// On-demand verify-then-maybe-retry for one record.
    pub async fn check_record(&self, id: &str) -> Result<ReconcileAction, AnchorError> {
        self.reconciler.verify_and_maybe_retry(id, Utc::now()).await
    }

    pub async fn account_info(&self, identity: &str) -> Result<AccountInfo, AnchorError> {
        self.pipeline.resolver().account_info(identity).await
    }

    pub async fn network_info(&self) -> Result<NetworkInfo, AnchorError> {
        Ok(self.ledger.network_info().await?)
    }

    pub async fn transaction_status(&self, hash: B256) -> Result<TransactionStatus, AnchorError> {
        Ok(self.ledger.transaction_status(hash).await?)
    }
}
