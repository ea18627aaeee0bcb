//! Identity → smart-account resolution.

use alloy_primitives::{Address, U256};
use alloy_signer_local::PrivateKeySigner;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::cache::KeyCache;
use super::keys::derive_owner_key;
use crate::chain::{AccountFactory, Coordinator, NativeLedger};
use crate::error::{AnchorError, ChainError};

/// Every identity gets the factory's account at salt 0.
pub const ACCOUNT_SALT: U256 = U256::ZERO;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAccount {
    pub owner_address: Address,
    pub smart_account_address: Address,
    pub salt: U256,
}

/// Resolved account plus whether its code is on chain yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartAccount {
    pub owner_address: Address,
    pub smart_account_address: Address,
    pub salt: U256,
    pub deployed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(flatten)]
    pub account: SmartAccount,
    pub balance: U256,
    pub nonce: U256,
}

pub struct AccountResolver {
    factory: Arc<dyn AccountFactory>,
    ledger: Arc<dyn NativeLedger>,
    coordinator: Arc<dyn Coordinator>,
    keys: KeyCache,
    // identity -> counterfactual address never changes, so no expiry
    addresses: Mutex<HashMap<String, ResolvedAccount>>,
}

impl AccountResolver {
    pub fn new(
        factory: Arc<dyn AccountFactory>,
        ledger: Arc<dyn NativeLedger>,
        coordinator: Arc<dyn Coordinator>,
        keys: KeyCache,
    ) -> Self {
        Self {
            factory,
            ledger,
            coordinator,
            keys,
            addresses: Mutex::new(HashMap::new()),
        }
    }

    /// Owner signing key for an identity, served from the key cache.
    pub fn owner_key(&self, identity: &str) -> Result<PrivateKeySigner, AnchorError> {
        self.keys.get_or_derive(identity, derive_owner_key)
    }

    pub async fn resolve(&self, identity: &str) -> Result<ResolvedAccount, AnchorError> {
        if let Some(hit) = self.cached(identity)? {
            return Ok(hit);
        }

        let owner_address = self.owner_key(identity)?.address();
        let smart_account_address = self
            .factory
            .predict_address(owner_address, ACCOUNT_SALT)
            .await
            .map_err(|e| AnchorError::Resolution(format!("factory unreachable: {}", e)))?;

        let resolved = ResolvedAccount {
            owner_address,
            smart_account_address,
            salt: ACCOUNT_SALT,
        };
        info!("👛 Account for {}: {} (owner {})", identity, smart_account_address, owner_address);

        self.addresses
            .lock()
            .map_err(|_| AnchorError::Resolution("address cache poisoned".to_string()))?
            .insert(identity.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Resolves and checks deployment; the deployed flag is read fresh each call.
    pub async fn smart_account(&self, identity: &str) -> Result<SmartAccount, AnchorError> {
        let resolved = self.resolve(identity).await?;
        let deployed = self
            .ledger
            .is_deployed(resolved.smart_account_address)
            .await
            .map_err(lookup_error)?;
        debug!("Account {} deployed={}", resolved.smart_account_address, deployed);
        Ok(SmartAccount {
            owner_address: resolved.owner_address,
            smart_account_address: resolved.smart_account_address,
            salt: resolved.salt,
            deployed,
        })
    }

    pub async fn account_info(&self, identity: &str) -> Result<AccountInfo, AnchorError> {
        let account = self.smart_account(identity).await?;
        let balance = self
            .ledger
            .balance_of(account.smart_account_address)
            .await
            .map_err(lookup_error)?;
        let nonce = self
            .coordinator
            .get_nonce(account.smart_account_address, U256::ZERO)
            .await
            .map_err(lookup_error)?;
        Ok(AccountInfo { account, balance, nonce })
    }

    fn cached(&self, identity: &str) -> Result<Option<ResolvedAccount>, AnchorError> {
        let addresses = self
            .addresses
            .lock()
            .map_err(|_| AnchorError::Resolution("address cache poisoned".to_string()))?;
        Ok(addresses.get(identity).cloned())
    }
}

fn lookup_error(err: ChainError) -> AnchorError {
    match err {
        ChainError::Network(_) | ChainError::RateLimited { .. } => err.into(),
        other => AnchorError::Resolution(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;

    fn resolver(chain: &Arc<MockChain>) -> AccountResolver {
        AccountResolver::new(chain.clone(), chain.clone(), chain.clone(), KeyCache::default())
    }

    #[tokio::test]
    async fn test_resolve_is_deterministic() {
        let chain = MockChain::new();
        let first = resolver(&chain).resolve("u1").await.unwrap();
        // a fresh resolver has no cache and must land on the same address
        let second = resolver(&chain).resolve("u1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.salt, U256::ZERO);
    }

    #[tokio::test]
    async fn test_resolve_caches_factory_read() {
        let chain = MockChain::new();
        let resolver = resolver(&chain);
        resolver.resolve("u1").await.unwrap();
        resolver.resolve("u1").await.unwrap();
        assert_eq!(chain.predict_calls(), 1);
    }

    #[tokio::test]
    async fn test_factory_down_is_resolution_error() {
        let chain = MockChain::new();
        chain.set_factory_down(true);
        let err = resolver(&chain).resolve("u1").await.unwrap_err();
        assert!(matches!(err, AnchorError::Resolution(_)));
    }

    #[tokio::test]
    async fn test_account_info_reports_deployment() {
        let chain = MockChain::new();
        let resolver = resolver(&chain);
        let info = resolver.account_info("u1").await.unwrap();
        assert!(!info.account.deployed);

        chain.mark_deployed(info.account.smart_account_address);
        assert!(resolver.smart_account("u1").await.unwrap().deployed);
    }
}
