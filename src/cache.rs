//! Time-bounded cache of operation results.
//!
//! Entries are stored through a [`KeyValueStore`] as JSON envelopes:
//!
//! ```json
//! { "data": <payload>, "timestamp": <unix millis> }
//! ```
//!
//! Caching is best effort. Every read or write failure is logged and turned
//! into a cache miss or a skipped write; nothing here returns an error.
use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{clock::Clock, error::CacheError, store::KeyValueStore};

/// The persisted envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    /// Wall-clock milliseconds at which the entry was written.
    pub timestamp: u64,
}

/// Builds the full lookup key `<prefix>-<JSON params>`.
///
/// Returns `None` (no caching for this call) if the params cannot be
/// serialized.
pub fn cache_key<P: Serialize + ?Sized>(prefix: &str, params: &P) -> Option<String> {
    match serde_json::to_string(params) {
        Ok(params) => Some(format!("{prefix}-{params}")),
        Err(err) => {
            tracing::warn!(error = %err, prefix, "params not serializable, caching skipped");
            None
        }
    }
}

/// TTL cache over a host store. Clones share the same store.
#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Returns the payload stored under `key` if it is younger than `ttl`.
    ///
    /// Expired and unreadable entries are removed from the store.
    pub fn get<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<T> {
        let raw = self.store.get(key)?;
        match self.decode::<T>(&raw) {
            Ok(entry) => {
                let age = self.clock.now_millis().saturating_sub(entry.timestamp);
                if u128::from(age) < ttl.as_millis() {
                    return Some(entry.data);
                }
                tracing::trace!(key, age_ms = age, "cache entry expired");
            }
            Err(err) => {
                tracing::warn!(error = %err, key, "failed to parse cache entry");
            }
        }
        self.store.remove(key);
        None
    }

    /// Stores `data` under `key`, stamped with the current time.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T) {
        if let Err(err) = self.try_set(key, data) {
            tracing::warn!(error = %err, key, "failed to write cache entry");
        }
    }

    fn decode<T: DeserializeOwned>(&self, raw: &str) -> Result<CacheEntry<T>, CacheError> {
        Ok(serde_json::from_str(raw)?)
    }

    fn try_set<T: Serialize + ?Sized>(&self, key: &str, data: &T) -> Result<(), CacheError> {
        let raw = serde_json::to_string(&CacheEntry {
            data,
            timestamp: self.clock.now_millis(),
        })?;
        self.store.set(key, raw)?;
        Ok(())
    }
}
