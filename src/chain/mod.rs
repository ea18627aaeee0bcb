//! Narrow interfaces to the on-chain collaborators.
//!
//! The anchoring core never talks to a node directly; it goes through these
//! traits so the JSON-RPC implementation (`evm`) and the scripted test chain
//! are interchangeable.

pub mod evm;
pub mod rpc_client;

#[cfg(test)]
pub mod mock;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ChainConfig;
use crate::error::ChainError;
use crate::operation::UserOperation;

pub use evm::EvmChain;
pub use rpc_client::RpcClient;

/// Inclusion receipt of a mined transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub gas_used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Registry view of one anchored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub fingerprint: B256,
    pub owner: Address,
    pub timestamp: u64,
    pub exists: bool,
}

impl RegistryEntry {
    pub fn missing() -> Self {
        Self {
            fingerprint: B256::ZERO,
            owner: Address::ZERO,
            timestamp: 0,
            exists: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed { block_number: u64, gas_used: u64 },
    Failed { block_number: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub chain_id: u64,
    pub block_number: u64,
    pub fees: Option<Fees>,
}

/// Validates and executes operations (the ERC-4337 entry point).
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn get_nonce(&self, sender: Address, key: U256) -> Result<U256, ChainError>;
    /// Canonical operation hash; the signature field is ignored.
    async fn hash_operation(&self, op: &UserOperation) -> Result<B256, ChainError>;
    async fn submit(&self, ops: &[UserOperation], beneficiary: Address) -> Result<Receipt, ChainError>;
}

#[async_trait]
pub trait AccountFactory: Send + Sync {
    async fn predict_address(&self, owner: Address, salt: U256) -> Result<Address, ChainError>;
    async fn create_account(&self, owner: Address, salt: U256) -> Result<Receipt, ChainError>;
}

#[async_trait]
pub trait Sponsor: Send + Sync {
    async fn get_deposit(&self) -> Result<U256, ChainError>;
    async fn fund(&self, amount: U256) -> Result<Receipt, ChainError>;
}

#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn get_fees(&self) -> Result<Fees, ChainError>;
}

/// On-chain truth source for anchored content.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get(&self, id: B256) -> Result<RegistryEntry, ChainError>;
}

/// Native-currency view of the chain plus the operator wallet that pays for
/// fallback funding.
#[async_trait]
pub trait NativeLedger: Send + Sync {
    async fn balance_of(&self, address: Address) -> Result<U256, ChainError>;
    async fn is_deployed(&self, address: Address) -> Result<bool, ChainError>;
    async fn transfer(&self, to: Address, amount: U256) -> Result<Receipt, ChainError>;
    async fn transaction_status(&self, hash: B256) -> Result<TransactionStatus, ChainError>;
    async fn network_info(&self) -> Result<NetworkInfo, ChainError>;
}

/// Addresses the builder and reconciler embed in call payloads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContractAddresses {
    pub coordinator: Address,
    pub factory: Address,
    pub registry: Address,
    pub sponsor: Address,
    pub beneficiary: Address,
}

impl From<&ChainConfig> for ContractAddresses {
    fn from(config: &ChainConfig) -> Self {
        Self {
            coordinator: config.coordinator,
            factory: config.factory,
            registry: config.registry,
            sponsor: config.sponsor,
            beneficiary: config.beneficiary(),
        }
    }
}

/// Every collaborator the core consumes, bundled for wiring.
#[derive(Clone)]
pub struct ChainHandles {
    pub coordinator: Arc<dyn Coordinator>,
    pub factory: Arc<dyn AccountFactory>,
    pub sponsor: Arc<dyn Sponsor>,
    pub fee_oracle: Option<Arc<dyn FeeOracle>>,
    pub registry: Arc<dyn Registry>,
    pub ledger: Arc<dyn NativeLedger>,
    pub addresses: ContractAddresses,
}
