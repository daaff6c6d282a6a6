use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// How long a built payout waits for its signature
pub const UNSIGNED_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Build → sign → submit handoff, one entry per wallet
#[derive(Clone)]
pub struct UnsignedTxCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl Default for UnsignedTxCache {
    fn default() -> Self {
        Self::new(UNSIGNED_TTL)
    }
}

impl UnsignedTxCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cache key for a wallet's root public key
    pub fn key_for(root_public_key: &str) -> String {
        hex::encode(Sha256::digest(root_public_key.as_bytes()))
    }

    pub fn insert(&self, root_public_key: &str, psbt_hex: String) {
        let expires = Instant::now() + self.ttl;
        self.lock()
            .insert(Self::key_for(root_public_key), (psbt_hex, expires));
    }

    pub fn get(&self, root_public_key: &str) -> Option<String> {
        let key = Self::key_for(root_public_key);
        let mut entries = self.lock();
        match entries.get(&key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn take(&self, root_public_key: &str) -> Option<String> {
        let (value, expires) = self.lock().remove(&Self::key_for(root_public_key))?;
        (expires > Instant::now()).then_some(value)
    }

    /// Returns how many entries were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, (_, expires)| *expires > now);
        before - entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
