//! Account-abstraction operations: the structure, its ABI bindings, and the
//! builder/signer pair that produces a submittable one.

pub mod builder;
pub mod signer;

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

pub use builder::{BuildRequest, GasDefaults, OperationBuilder};
pub use signer::{OperationSigner, SignedOperation};

/// Solidity bindings for every contract call the core encodes.
pub mod abi {
    use alloy_sol_types::sol;

    sol! {
        struct UserOperationAbi {
            address sender;
            uint256 nonce;
            bytes initCode;
            bytes callData;
            uint256 callGasLimit;
            uint256 verificationGasLimit;
            uint256 preVerificationGas;
            uint256 maxFeePerGas;
            uint256 maxPriorityFeePerGas;
            bytes paymasterAndData;
            bytes signature;
        }

        // coordinator
        function getUserOpHash(UserOperationAbi userOp) external view returns (bytes32);
        function handleOps(UserOperationAbi[] ops, address beneficiary) external;
        function getNonce(address sender, uint192 key) external view returns (uint256 nonce);
        function balanceOf(address account) external view returns (uint256);

        // factory
        function createAccount(address owner, uint256 salt) external returns (address);
        function getAddress(address owner, uint256 salt) external view returns (address);

        // smart account
        function execute(address dest, uint256 value, bytes func) external;

        // registry
        function registerNote(bytes32 noteId, bytes32 noteHash) external;
        function updateNote(bytes32 noteId, bytes32 newNoteHash) external;
        function getNote(bytes32 noteId) external view returns (bytes32, address, uint256, bool);

        // sponsor
        function fundPaymaster() external payable;

        event UserOperationEvent(
            bytes32 indexed userOpHash,
            address indexed sender,
            address indexed paymaster,
            uint256 nonce,
            bool success,
            uint256 actualGasCost,
            uint256 actualGasUsed
        );
    }
}

/// ERC-4337 (v0.6) user operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    pub fn is_sponsored(&self) -> bool {
        !self.paymaster_and_data.is_empty()
    }

    /// Upper bound on what the operation can cost its payer.
    pub fn max_cost(&self) -> U256 {
        let gas = self.call_gas_limit + self.verification_gas_limit + self.pre_verification_gas;
        gas.saturating_mul(self.max_fee_per_gas)
    }
}

impl From<&UserOperation> for abi::UserOperationAbi {
    fn from(op: &UserOperation) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            initCode: op.init_code.clone(),
            callData: op.call_data.clone(),
            callGasLimit: op.call_gas_limit,
            verificationGasLimit: op.verification_gas_limit,
            preVerificationGas: op.pre_verification_gas,
            maxFeePerGas: op.max_fee_per_gas,
            maxPriorityFeePerGas: op.max_priority_fee_per_gas,
            paymasterAndData: op.paymaster_and_data.clone(),
            signature: op.signature.clone(),
        }
    }
}
