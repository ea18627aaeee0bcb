use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::SolCall;
use std::sync::Arc;
use tracing::{debug, warn};

use super::abi::{createAccountCall, executeCall};
use super::UserOperation;
use crate::account::SmartAccount;
use crate::chain::{Coordinator, FeeOracle, Fees};
use crate::error::{AnchorError, ChainError};

const GWEI: u64 = 1_000_000_000;

/// Conservative gas limits and fallback fees.
#[derive(Debug, Clone, Copy)]
pub struct GasDefaults {
    pub call_gas_limit: u64,
    pub verification_gas_limit: u64,
    /// Used instead of `verification_gas_limit` when the account is deployed
    /// by this operation.
    pub deploy_verification_gas_limit: u64,
    pub pre_verification_gas: u64,
    pub fallback_fees: Fees,
}

impl Default for GasDefaults {
    fn default() -> Self {
        Self {
            call_gas_limit: 200_000,
            verification_gas_limit: 150_000,
            deploy_verification_gas_limit: 500_000,
            pre_verification_gas: 50_000,
            fallback_fees: Fees {
                max_fee_per_gas: U256::from(20 * GWEI),
                max_priority_fee_per_gas: U256::from(2 * GWEI),
            },
        }
    }
}

/// What the operation should do, from whose account, and who pays.
pub struct BuildRequest<'a> {
    pub account: &'a SmartAccount,
    pub target: Address,
    pub inner_payload: Bytes,
    pub sponsored: bool,
}

pub struct OperationBuilder {
    coordinator: Arc<dyn Coordinator>,
    fee_oracle: Option<Arc<dyn FeeOracle>>,
    factory: Address,
    sponsor: Address,
    gas: GasDefaults,
}

impl OperationBuilder {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        fee_oracle: Option<Arc<dyn FeeOracle>>,
        factory: Address,
        sponsor: Address,
        gas: GasDefaults,
    ) -> Self {
        Self {
            coordinator,
            fee_oracle,
            factory,
            sponsor,
            gas,
        }
    }

    /// Assembles a complete, unsigned operation. The nonce is read from the
    /// coordinator on every call.
    pub async fn build(&self, request: BuildRequest<'_>) -> Result<UserOperation, AnchorError> {
        let account = request.account;
        if request.inner_payload.is_empty() {
            return Err(AnchorError::Build("empty call payload".to_string()));
        }

        let init_code = if account.deployed {
            Bytes::new()
        } else {
            self.deploy_code(account.owner_address, account.salt)
        };

        let call_data = executeCall {
            dest: request.target,
            value: U256::ZERO,
            func: request.inner_payload,
        }
        .abi_encode();

        let nonce = self
            .coordinator
            .get_nonce(account.smart_account_address, U256::ZERO)
            .await
            .map_err(build_error)?;

        let verification_gas_limit = if init_code.is_empty() {
            self.gas.verification_gas_limit
        } else {
            self.gas.deploy_verification_gas_limit
        };

        let fees = self.fees().await;

        let paymaster_and_data = if request.sponsored {
            Bytes::copy_from_slice(self.sponsor.as_slice())
        } else {
            Bytes::new()
        };

        let op = UserOperation {
            sender: account.smart_account_address,
            nonce,
            init_code,
            call_data: call_data.into(),
            call_gas_limit: U256::from(self.gas.call_gas_limit),
            verification_gas_limit: U256::from(verification_gas_limit),
            pre_verification_gas: U256::from(self.gas.pre_verification_gas),
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            paymaster_and_data,
            signature: Bytes::new(),
        };
        debug!(
            "🔧 Built operation for {} nonce={} deploy={} sponsored={}",
            op.sender,
            op.nonce,
            !op.init_code.is_empty(),
            op.is_sponsored()
        );
        Ok(op)
    }

    /// `factory ++ createAccount(owner, salt)`
    pub fn deploy_code(&self, owner: Address, salt: U256) -> Bytes {
        let mut code = self.factory.to_vec();
        code.extend(createAccountCall { owner, salt }.abi_encode());
        code.into()
    }

    async fn fees(&self) -> Fees {
        let Some(oracle) = &self.fee_oracle else {
            return self.gas.fallback_fees;
        };
        match oracle.get_fees().await {
            Ok(fees) => fees,
            Err(e) => {
                warn!("Fee oracle unavailable ({}), using fallback fees", e);
                self.gas.fallback_fees
            }
        }
    }
}

fn build_error(err: ChainError) -> AnchorError {
    match err {
        ChainError::Network(_) | ChainError::RateLimited { .. } => err.into(),
        other => AnchorError::Build(format!("nonce lookup failed: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;

    fn account(deployed: bool) -> SmartAccount {
        SmartAccount {
            owner_address: Address::repeat_byte(0x11),
            smart_account_address: Address::repeat_byte(0x22),
            salt: U256::ZERO,
            deployed,
        }
    }

    fn builder(chain: &Arc<MockChain>, oracle: bool) -> OperationBuilder {
        let fee_oracle: Option<Arc<dyn FeeOracle>> = if oracle { Some(chain.clone() as Arc<dyn FeeOracle>) } else { None };
        OperationBuilder::new(
            chain.clone(),
            fee_oracle,
            Address::repeat_byte(0xfa),
            Address::repeat_byte(0x5e),
            GasDefaults::default(),
        )
    }

    #[tokio::test]
    async fn test_undeployed_account_gets_deploy_code() {
        let chain = MockChain::new();
        let account = account(false);
        let op = builder(&chain, false)
            .build(BuildRequest {
                account: &account,
                target: Address::repeat_byte(0x33),
                inner_payload: Bytes::from_static(&[1, 2, 3, 4]),
                sponsored: true,
            })
            .await
            .unwrap();

        assert_eq!(&op.init_code[..20], Address::repeat_byte(0xfa).as_slice());
        assert_eq!(&op.init_code[20..24], createAccountCall::SELECTOR.as_slice());
        assert_eq!(op.verification_gas_limit, U256::from(500_000u64));
        assert_eq!(op.paymaster_and_data.as_ref(), Address::repeat_byte(0x5e).as_slice());
        assert_eq!(&op.call_data[..4], executeCall::SELECTOR.as_slice());
        assert!(op.signature.is_empty());
    }

    #[tokio::test]
    async fn test_deployed_unsponsored_operation() {
        let chain = MockChain::new();
        chain.set_nonce(Address::repeat_byte(0x22), U256::from(7u64));
        let account = account(true);
        let op = builder(&chain, false)
            .build(BuildRequest {
                account: &account,
                target: Address::repeat_byte(0x33),
                inner_payload: Bytes::from_static(&[1, 2, 3, 4]),
                sponsored: false,
            })
            .await
            .unwrap();

        assert!(op.init_code.is_empty());
        assert!(op.paymaster_and_data.is_empty());
        assert_eq!(op.nonce, U256::from(7u64));
        assert_eq!(op.verification_gas_limit, U256::from(150_000u64));
        assert_eq!(op.max_fee_per_gas, U256::from(20 * GWEI));
    }

    #[tokio::test]
    async fn test_fee_oracle_used_when_present() {
        let chain = MockChain::new();
        let account = account(true);
        let op = builder(&chain, true)
            .build(BuildRequest {
                account: &account,
                target: Address::repeat_byte(0x33),
                inner_payload: Bytes::from_static(&[9]),
                sponsored: false,
            })
            .await
            .unwrap();
        assert_eq!(op.max_fee_per_gas, chain.fees().max_fee_per_gas);
    }

    #[tokio::test]
    async fn test_empty_payload_rejected() {
        let chain = MockChain::new();
        let account = account(true);
        let err = builder(&chain, false)
            .build(BuildRequest {
                account: &account,
                target: Address::repeat_byte(0x33),
                inner_payload: Bytes::new(),
                sponsored: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AnchorError::Build(_)));
    }
}
