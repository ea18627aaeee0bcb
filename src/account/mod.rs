//! Account Resolver
//!
//! Maps a user identity to:
//! - a deterministic owner key (HMAC-derived secp256k1 secret)
//! - the counterfactual smart-account address the factory predicts for it
//! - the account's deployment state, balance and nonce

pub mod cache;
pub mod keys;
pub mod resolver;

pub use cache::KeyCache;
pub use keys::derive_owner_key;
pub use resolver::{AccountInfo, AccountResolver, ResolvedAccount, SmartAccount, ACCOUNT_SALT};
