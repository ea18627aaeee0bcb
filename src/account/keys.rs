//! Deterministic owner-key derivation.

use alloy_primitives::B256;
use alloy_signer_local::PrivateKeySigner;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AnchorError;

type HmacSha256 = Hmac<Sha256>;

/// Fixed domain constant keying the derivation. Changing it moves every
/// identity to a different account.
pub const OWNER_KEY_DOMAIN: &[u8] = b"content-anchor/owner-key/v1";

/// A digest that is zero or above the curve order is not a usable secret;
/// the counter suffix picks the next candidate.
const MAX_DERIVATION_ROUNDS: u8 = 8;

/// Derives the owner signing key for an identity.
///
/// HMAC-SHA256 keyed with [`OWNER_KEY_DOMAIN`] over the identity bytes, read
/// as a secp256k1 secret scalar. The same identity always yields the same key.
pub fn derive_owner_key(identity: &str) -> Result<PrivateKeySigner, AnchorError> {
    if identity.is_empty() {
        return Err(AnchorError::Resolution("empty identity".to_string()));
    }

    for round in 0..MAX_DERIVATION_ROUNDS {
        let mut mac = HmacSha256::new_from_slice(OWNER_KEY_DOMAIN)
            .map_err(|e| AnchorError::Resolution(format!("key derivation failed: {}", e)))?;
        mac.update(identity.as_bytes());
        if round > 0 {
            mac.update(&[round]);
        }
        let digest = mac.finalize().into_bytes();

        if let Ok(signer) = PrivateKeySigner::from_bytes(&B256::from_slice(&digest)) {
            return Ok(signer);
        }
    }

    Err(AnchorError::Resolution(format!(
        "no valid owner key for identity after {} rounds",
        MAX_DERIVATION_ROUNDS
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_owner_key("u1").unwrap();
        let b = derive_owner_key("u1").unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn test_identities_get_distinct_keys() {
        let a = derive_owner_key("u1").unwrap();
        let b = derive_owner_key("u2").unwrap();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_empty_identity_rejected() {
        assert!(matches!(derive_owner_key(""), Err(AnchorError::Resolution(_))));
    }
}
