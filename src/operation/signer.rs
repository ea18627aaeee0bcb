use alloy_primitives::{Bytes, B256};
use alloy_signer::SignerSync;
use std::sync::Arc;
use tracing::debug;

use super::UserOperation;
use crate::account::AccountResolver;
use crate::chain::Coordinator;
use crate::error::{AnchorError, ChainError};

/// An operation together with the hash its signature commits to.
///
/// Fields are private: changing anything after signing would invalidate the
/// signature. A changed operation goes back through the builder and signer.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedOperation {
    operation: UserOperation,
    hash: B256,
}

impl SignedOperation {
    pub fn operation(&self) -> &UserOperation {
        &self.operation
    }

    pub fn hash(&self) -> B256 {
        self.hash
    }
}

pub struct OperationSigner {
    coordinator: Arc<dyn Coordinator>,
    resolver: Arc<AccountResolver>,
}

impl OperationSigner {
    pub fn new(coordinator: Arc<dyn Coordinator>, resolver: Arc<AccountResolver>) -> Self {
        Self { coordinator, resolver }
    }

    /// Signs the coordinator's canonical hash of `op` with the identity's
    /// owner key (EIP-191 personal-message form).
    pub async fn sign(&self, mut op: UserOperation, identity: &str) -> Result<SignedOperation, AnchorError> {
        op.signature = Bytes::new();
        let hash = self
            .coordinator
            .hash_operation(&op)
            .await
            .map_err(signature_error)?;

        let owner = self.resolver.owner_key(identity)?;
        let signature = owner
            .sign_message_sync(hash.as_slice())
            .map_err(|e| AnchorError::Signature(e.to_string()))?;

        op.signature = Bytes::from(signature.as_bytes().to_vec());
        debug!("✍️ Signed operation {} for {}", hash, op.sender);
        Ok(SignedOperation { operation: op, hash })
    }
}

fn signature_error(err: ChainError) -> AnchorError {
    match err {
        ChainError::Network(_) | ChainError::RateLimited { .. } => err.into(),
        other => AnchorError::Signature(format!("hash lookup failed: {}", other)),
    }
}
