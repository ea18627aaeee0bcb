use alloy_primitives::{Address, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AnchorError;

const WEI_PER_UNIT: u64 = 1_000_000_000_000_000_000;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AnchorConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeConfig {
    pub rpc_port: u16,
    pub db_path: String,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_port: 9100,
            db_path: "./data/anchor".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Chain endpoints and contract addresses. The operator account must be
/// unlocked on the RPC endpoint; it pays for fallback funding and top-ups.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub operator: Address,
    pub coordinator: Address,
    pub factory: Address,
    pub registry: Address,
    pub sponsor: Address,
    /// Receives the coordinator's gas refund; defaults to the operator.
    #[serde(default)]
    pub beneficiary: Option<Address>,
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
}

fn default_receipt_timeout_secs() -> u64 {
    120
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            operator: Address::ZERO,
            coordinator: Address::ZERO,
            factory: Address::ZERO,
            registry: Address::ZERO,
            sponsor: Address::ZERO,
            beneficiary: None,
            receipt_timeout_secs: default_receipt_timeout_secs(),
        }
    }
}

impl ChainConfig {
    pub fn beneficiary(&self) -> Address {
        self.beneficiary.unwrap_or(self.operator)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReconcilerConfig {
    pub stuck_window_secs: u64,
    pub give_up_after_secs: u64,
    pub max_retries: u32,
    pub sweep_interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stuck_window_secs: 5 * 60,
            give_up_after_secs: 15 * 60,
            max_retries: 3,
            sweep_interval_secs: 60,
        }
    }
}

/// Thresholds are expressed in native units (e.g. "0.05").
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub min_threshold: Decimal,
    pub target_threshold: Decimal,
    pub avg_op_cost: Decimal,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30 * 60,
            min_threshold: Decimal::new(5, 2),
            target_threshold: Decimal::new(4, 1),
            avg_op_cost: Decimal::new(2, 3),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SubmissionConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    /// Smallest direct top-up (native units) sent to a smart account that
    /// cannot cover its own gas on the unsponsored path.
    pub fallback_funding: Decimal,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_secs: 60,
            fallback_funding: Decimal::new(5, 3),
        }
    }
}

impl SubmissionConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

/// Converts a decimal amount of native units into wei.
pub fn to_wei(amount: Decimal) -> Result<U256, AnchorError> {
    if amount.is_sign_negative() {
        return Err(AnchorError::Config(format!("negative amount: {}", amount)));
    }
    let wei = (amount * Decimal::from(WEI_PER_UNIT))
        .trunc()
        .to_u128()
        .ok_or_else(|| AnchorError::Config(format!("amount out of range: {}", amount)))?;
    Ok(U256::from(wei))
}

/// Renders wei as a decimal amount of native units.
pub fn from_wei(wei: U256) -> Decimal {
    let wei = u128::try_from(wei)
        .ok()
        .and_then(|w| i128::try_from(w).ok())
        .unwrap_or(i128::MAX);
    Decimal::try_from_i128_with_scale(wei, 18).unwrap_or(Decimal::MAX)
}

impl AnchorConfig {
    pub fn load_or_default(path: &str) -> Self {
        let mut config = if std::path::Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => {
                        tracing::info!("Config loaded from {}", path);
                        c
                    }
                    Err(e) => {
                        tracing::warn!("Error parsing config: {}. Using defaults.", e);
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::warn!("Error reading config: {}. Using defaults.", e);
                    Self::default()
                }
            }
        } else {
            tracing::info!("Config file not found at '{}'. Creating default.", path);
            let config = Self::default();
            if let Ok(s) = toml::to_string_pretty(&config) {
                let _ = std::fs::write(path, s);
            }
            config
        };
        config.apply_env();
        config
    }

    /// `RPC_URL` and the `*_ADDRESS` variables override the file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("RPC_URL") {
            self.chain.rpc_url = url;
        }
        let overrides: [(&str, &mut Address); 5] = [
            ("OPERATOR_ADDRESS", &mut self.chain.operator),
            ("ENTRY_POINT_ADDRESS", &mut self.chain.coordinator),
            ("ACCOUNT_FACTORY_ADDRESS", &mut self.chain.factory),
            ("NOTES_REGISTRY_ADDRESS", &mut self.chain.registry),
            ("PAYMASTER_ADDRESS", &mut self.chain.sponsor),
        ];
        for (var, slot) in overrides {
            if let Ok(value) = std::env::var(var) {
                match value.parse::<Address>() {
                    Ok(addr) => *slot = addr,
                    Err(e) => tracing::warn!("Ignoring {}: {}", var, e),
                }
            }
        }
    }

    /// Rejects configurations that cannot talk to a chain.
    pub fn validate(&self) -> Result<(), AnchorError> {
        let required = [
            ("operator", self.chain.operator),
            ("coordinator", self.chain.coordinator),
            ("factory", self.chain.factory),
            ("registry", self.chain.registry),
            ("sponsor", self.chain.sponsor),
        ];
        for (name, addr) in required {
            if addr == Address::ZERO {
                return Err(AnchorError::Config(format!("chain.{} address is not set", name)));
            }
        }
        if self.monitor.target_threshold < self.monitor.min_threshold {
            return Err(AnchorError::Config(
                "monitor.target_threshold must be >= monitor.min_threshold".to_string(),
            ));
        }
        if self.submission.max_attempts == 0 {
            return Err(AnchorError::Config("submission.max_attempts must be >= 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wei_conversion() {
        assert_eq!(to_wei(Decimal::new(5, 2)).unwrap(), U256::from(50_000_000_000_000_000u64));
        assert_eq!(from_wei(U256::from(400_000_000_000_000_000u64)), Decimal::new(4, 1));
        assert!(to_wei(Decimal::new(-1, 0)).is_err());
    }

    #[test]
    fn test_defaults_roundtrip_through_toml() {
        let config = AnchorConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AnchorConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.reconciler.stuck_window_secs, 300);
        assert_eq!(parsed.monitor.min_threshold, Decimal::new(5, 2));
        assert_eq!(parsed.submission.max_attempts, 3);
    }

    #[test]
    fn test_validate_requires_addresses() {
        let config = AnchorConfig::default();
        assert!(matches!(config.validate(), Err(AnchorError::Config(_))));
    }
}
