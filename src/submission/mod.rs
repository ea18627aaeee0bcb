//! Submission Pipeline
//!
//! Two explicit steps:
//! 1. the sponsored operation goes to the coordinator (transient failures are
//!    retried in place with bounded backoff);
//! 2. only if the sponsor rejected it, the operation is rebuilt without
//!    sponsorship, the smart account is topped up from the operator wallet,
//!    re-signed, and submitted once more.
//!
//! Validation failures and anything failing in step 2 are terminal, except
//! a rejection that follows an interrupted submit: the first try may have
//! landed, so that outcome is reported as uncertain.

pub mod retry;

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::account::{AccountResolver, KeyCache, SmartAccount};
use crate::chain::{ChainHandles, Coordinator, NativeLedger};
use crate::config::{to_wei, SubmissionConfig};
use crate::error::AnchorError;
use crate::operation::{BuildRequest, GasDefaults, OperationBuilder, OperationSigner, SignedOperation};

pub use retry::{with_backoff, RetryPolicy};

/// A call the identity's smart account should make.
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub identity: String,
    pub target: Address,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub transaction_ref: B256,
    pub block_ref: u64,
    pub gas_used: u64,
    pub operation_hash: B256,
    pub sponsored: bool,
}

/// How one submission attempt ended.
#[derive(Debug)]
enum AttemptOutcome {
    Included(SubmissionReceipt),
    /// Sponsor-side rejection of a sponsored operation; the only outcome
    /// that opens the unsponsored path.
    SponsorRejected(AnchorError),
    Rejected(AnchorError),
}

pub struct SubmissionPipeline {
    resolver: Arc<AccountResolver>,
    builder: OperationBuilder,
    signer: OperationSigner,
    coordinator: Arc<dyn Coordinator>,
    ledger: Arc<dyn NativeLedger>,
    beneficiary: Address,
    retry: RetryPolicy,
    fallback_funding: U256,
}

impl SubmissionPipeline {
    pub fn from_handles(handles: &ChainHandles, config: &SubmissionConfig) -> Result<Self, AnchorError> {
        let resolver = Arc::new(AccountResolver::new(
            handles.factory.clone(),
            handles.ledger.clone(),
            handles.coordinator.clone(),
            KeyCache::default(),
        ));
        let builder = OperationBuilder::new(
            handles.coordinator.clone(),
            handles.fee_oracle.clone(),
            handles.addresses.factory,
            handles.addresses.sponsor,
            GasDefaults::default(),
        );
        let signer = OperationSigner::new(handles.coordinator.clone(), resolver.clone());
        Ok(Self {
            resolver,
            builder,
            signer,
            coordinator: handles.coordinator.clone(),
            ledger: handles.ledger.clone(),
            beneficiary: handles.addresses.beneficiary,
            retry: RetryPolicy::from(config),
            fallback_funding: to_wei(config.fallback_funding)?,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn resolver(&self) -> &Arc<AccountResolver> {
        &self.resolver
    }

    pub async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionReceipt, AnchorError> {
        let account = self.account(&request.identity).await?;
        let signed = self.prepare(request, &account, true).await?;

        match self.attempt(&signed).await {
            AttemptOutcome::Included(receipt) => Ok(receipt),
            AttemptOutcome::Rejected(e) => Err(e),
            AttemptOutcome::SponsorRejected(cause) => {
                warn!(
                    "💸 Sponsor rejected operation {} ({}). Falling back to self-paid submission",
                    signed.hash(),
                    cause
                );
                self.fallback(request).await
            }
        }
    }

    async fn fallback(&self, request: &SubmissionRequest) -> Result<SubmissionReceipt, AnchorError> {
        // the deployed flag and nonce are read again; the first attempt may
        // have changed neither or both
        let account = self.account(&request.identity).await?;
        let signed = self.prepare(request, &account, false).await?;
        self.ensure_funded(&account, signed.operation().max_cost()).await?;

        match self.attempt(&signed).await {
            AttemptOutcome::Included(receipt) => Ok(receipt),
            AttemptOutcome::SponsorRejected(e) | AttemptOutcome::Rejected(e) => {
                warn!("❌ Self-paid fallback for {} failed: {}", account.smart_account_address, e);
                Err(e)
            }
        }
    }

    async fn account(&self, identity: &str) -> Result<SmartAccount, AnchorError> {
        let resolver = &self.resolver;
        with_backoff(&self.retry, "resolve account", move || resolver.smart_account(identity)).await
    }

    /// Build, then sign. Signing is always the last step so the signature
    /// covers the final sponsor field.
    async fn prepare(
        &self,
        request: &SubmissionRequest,
        account: &SmartAccount,
        sponsored: bool,
    ) -> Result<SignedOperation, AnchorError> {
        let builder = &self.builder;
        let op = with_backoff(&self.retry, "build operation", move || {
            builder.build(BuildRequest {
                account,
                target: request.target,
                inner_payload: request.payload.clone(),
                sponsored,
            })
        })
        .await?;

        let signer = &self.signer;
        let identity = request.identity.as_str();
        with_backoff(&self.retry, "sign operation", move || signer.sign(op.clone(), identity)).await
    }

    async fn attempt(&self, signed: &SignedOperation) -> AttemptOutcome {
        let coordinator = &self.coordinator;
        let beneficiary = self.beneficiary;
        let op = signed.operation();
        let interrupted = AtomicBool::new(false);
        let interrupted_ref = &interrupted;

        let result = with_backoff(&self.retry, "submit operation", move || async move {
            let result = coordinator
                .submit(std::slice::from_ref(op), beneficiary)
                .await
                .map_err(AnchorError::from);
            if matches!(&result, Err(e) if e.is_transient()) {
                interrupted_ref.store(true, Ordering::Relaxed);
            }
            result
        })
        .await;

        match result {
            Ok(receipt) => {
                info!(
                    "✅ Operation {} included in block {} (tx {}, sponsored={})",
                    signed.hash(),
                    receipt.block_number,
                    receipt.transaction_hash,
                    op.is_sponsored()
                );
                AttemptOutcome::Included(SubmissionReceipt {
                    transaction_ref: receipt.transaction_hash,
                    block_ref: receipt.block_number,
                    gas_used: receipt.gas_used,
                    operation_hash: signed.hash(),
                    sponsored: op.is_sponsored(),
                })
            }
            // An earlier try may have landed, so a rejection of the resend
            // proves nothing until the registry is checked.
            Err(e) if interrupted.load(Ordering::Relaxed) && !e.is_uncertain() => {
                warn!("Resend of {} rejected after an interrupted submit: {}", signed.hash(), e);
                AttemptOutcome::Rejected(AnchorError::TimeoutUncertain(format!(
                    "resubmission after an interrupted submit failed: {}",
                    e
                )))
            }
            Err(e @ AnchorError::Sponsor(_)) if op.is_sponsored() => AttemptOutcome::SponsorRejected(e),
            Err(e) => AttemptOutcome::Rejected(e),
        }
    }

    /// Tops the smart account up from the operator wallet when it cannot
    /// cover `required`. Sends the shortfall, never less than the configured
    /// minimum.
    async fn ensure_funded(&self, account: &SmartAccount, required: U256) -> Result<(), AnchorError> {
        let address = account.smart_account_address;
        let ledger = &self.ledger;
        let balance = with_backoff(&self.retry, "read account balance", move || async move {
            ledger.balance_of(address).await.map_err(AnchorError::from)
        })
        .await?;
        if balance >= required {
            return Ok(());
        }

        let amount = (required - balance).max(self.fallback_funding);
        info!("⛽ Funding {} with {} wei for self-paid submission", address, amount);
        with_backoff(&self.retry, "fund account", move || async move {
            ledger.transfer(address, amount).await.map_err(AnchorError::from)
        })
        .await
        .map_err(|e| match e {
            e if e.is_uncertain() => e,
            other => AnchorError::Sponsor(format!("fallback funding failed: {}", other)),
        })?;
        Ok(())
    }
}
