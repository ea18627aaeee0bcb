//! Bounded, expiring cache for derived owner keys.

use alloy_signer_local::PrivateKeySigner;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::AnchorError;

struct CachedKey {
    signer: PrivateKeySigner,
    inserted_at: Instant,
}

/// Owned by one resolver; holds at most `capacity` keys, each for at most `ttl`.
pub struct KeyCache {
    entries: Mutex<HashMap<String, CachedKey>>,
    capacity: usize,
    ttl: Duration,
}

impl KeyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Returns the cached key or derives, stores and returns a fresh one.
    pub fn get_or_derive<F>(&self, identity: &str, derive: F) -> Result<PrivateKeySigner, AnchorError>
    where
        F: FnOnce(&str) -> Result<PrivateKeySigner, AnchorError>,
    {
        let now = Instant::now();
        {
            let entries = self.lock()?;
            if let Some(entry) = entries.get(identity) {
                if now.duration_since(entry.inserted_at) < self.ttl {
                    return Ok(entry.signer.clone());
                }
            }
        }

        let signer = derive(identity)?;

        let mut entries = self.lock()?;
        entries.retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);
        if entries.len() >= self.capacity && !entries.contains_key(identity) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            identity.to_string(),
            CachedKey {
                signer: signer.clone(),
                inserted_at: now,
            },
        );
        Ok(signer)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CachedKey>>, AnchorError> {
        self.entries
            .lock()
            .map_err(|_| AnchorError::Resolution("key cache poisoned".to_string()))
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(1024, Duration::from_secs(15 * 60))
    }
}
