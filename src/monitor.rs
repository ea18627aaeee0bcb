//! Resource Monitor
//!
//! Samples the sponsor deposit, refills it from the operator wallet when it
//! drops below the minimum, and estimates how many more operations it can
//! pay for. Runs once at start, then on a fixed interval.

use alloy_primitives::{B256, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::chain::Sponsor;
use crate::config::{from_wei, to_wei, MonitorConfig};
use crate::error::AnchorError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorDepositState {
    pub balance: Decimal,
    pub min_threshold: Decimal,
    pub target_threshold: Decimal,
    pub estimated_remaining_ops: u64,
    pub below_min_threshold: bool,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopUpReport {
    pub funded: bool,
    pub old_balance: Decimal,
    pub new_balance: Decimal,
    pub amount: Decimal,
    pub transaction_ref: Option<B256>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Low,
    Sufficient,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorHealth {
    pub balance: Option<Decimal>,
    pub estimated_remaining_ops: u64,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SponsorMonitor {
    sponsor: Arc<dyn Sponsor>,
    min_threshold: U256,
    target_threshold: U256,
    avg_op_cost: U256,
    interval: Duration,
    last: RwLock<Option<SponsorDepositState>>,
}

impl SponsorMonitor {
    pub fn new(sponsor: Arc<dyn Sponsor>, config: &MonitorConfig) -> Result<Self, AnchorError> {
        if config.target_threshold < config.min_threshold {
            return Err(AnchorError::Config(
                "monitor target_threshold must not be below min_threshold".to_string(),
            ));
        }
        Ok(Self {
            sponsor,
            min_threshold: to_wei(config.min_threshold)?,
            target_threshold: to_wei(config.target_threshold)?,
            avg_op_cost: to_wei(config.avg_op_cost)?,
            interval: Duration::from_secs(config.interval_secs),
            last: RwLock::new(None),
        })
    }

    /// Reads the live deposit. Never served from cache.
    pub async fn sample(&self) -> Result<SponsorDepositState, AnchorError> {
        let balance = self.sponsor.get_deposit().await?;
        Ok(self.sample_from(balance).await)
    }

    /// The most recent sample, if any.
    pub async fn state(&self) -> Option<SponsorDepositState> {
        self.last.read().await.clone()
    }

    pub fn estimate_remaining_ops(&self, balance: U256) -> u64 {
        if self.avg_op_cost.is_zero() {
            return u64::MAX;
        }
        u64::try_from(balance / self.avg_op_cost).unwrap_or(u64::MAX)
    }

    /// Samples, and if the deposit is below the minimum funds it back up to
    /// the target, then samples again to confirm.
    pub async fn check_and_fund(&self) -> Result<TopUpReport, AnchorError> {
        let balance = self.sponsor.get_deposit().await?;
        let before = self.sample_from(balance).await;
        if balance >= self.min_threshold {
            return Ok(TopUpReport {
                funded: false,
                old_balance: before.balance,
                new_balance: before.balance,
                amount: Decimal::ZERO,
                transaction_ref: None,
            });
        }

        let amount = self.target_threshold.saturating_sub(balance);
        warn!(
            "🪫 Sponsor deposit {} below minimum {}, topping up by {}",
            before.balance,
            before.min_threshold,
            from_wei(amount)
        );
        let receipt = self
            .sponsor
            .fund(amount)
            .await
            .map_err(|e| AnchorError::Sponsor(format!("sponsor top-up failed: {}", e)))?;

        let after = self.sample().await?;
        info!(
            "💰 Sponsor funded: {} -> {} (tx {})",
            before.balance, after.balance, receipt.transaction_hash
        );
        Ok(TopUpReport {
            funded: true,
            old_balance: before.balance,
            new_balance: after.balance,
            amount: from_wei(amount),
            transaction_ref: Some(receipt.transaction_hash),
        })
    }

    pub async fn health(&self) -> SponsorHealth {
        match self.sample().await {
            Ok(state) => SponsorHealth {
                balance: Some(state.balance),
                estimated_remaining_ops: state.estimated_remaining_ops,
                status: if state.below_min_threshold {
                    HealthStatus::Low
                } else {
                    HealthStatus::Sufficient
                },
                error: None,
            },
            Err(e) => SponsorHealth {
                balance: None,
                estimated_remaining_ops: 0,
                status: HealthStatus::Error,
                error: Some(e.to_string()),
            },
        }
    }

    /// Checks immediately, then every interval, until `stop` changes.
    /// A failed check is logged and the loop carries on.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!("🔭 Sponsor monitor started (every {:?})", self.interval);
        loop {
            match self.check_and_fund().await {
                Ok(report) if report.funded => {
                    info!("Sponsor top-up complete, deposit now {}", report.new_balance)
                }
                Ok(report) => info!("Sponsor deposit healthy: {}", report.old_balance),
                Err(e) => error!("❌ Sponsor check failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop.changed() => {
                    info!("🛑 Sponsor monitor stopped");
                    return;
                }
            }
        }
    }

    async fn sample_from(&self, balance: U256) -> SponsorDepositState {
        let state = SponsorDepositState {
            balance: from_wei(balance),
            min_threshold: from_wei(self.min_threshold),
            target_threshold: from_wei(self.target_threshold),
            estimated_remaining_ops: self.estimate_remaining_ops(balance),
            below_min_threshold: balance < self.min_threshold,
            sampled_at: Utc::now(),
        };
        *self.last.write().await = Some(state.clone());
        state
    }
}
