//! Host persistent key-value stores.
//!
//! [`KeyValueStore`] is the only storage contract the crate relies on:
//! string keys, string values. Two implementations are provided, an
//! in-memory map and a directory of files.
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use sha2::{Digest, Sha256};

use crate::error::{Error, StoreError};

/// A persistent string-keyed store supplied by the host.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    fn remove(&self, key: &str);
}

/// An in-memory store, optionally bounded in entry count.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    capacity: Option<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects writes of new keys once `capacity` entries exist.
    /// Overwriting an existing key always succeeds.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.entries();
        if let Some(capacity) = self.capacity {
            if !entries.contains_key(key) && entries.len() >= capacity {
                return Err(StoreError::CapacityExceeded { capacity });
            }
        }
        entries.insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.entries().remove(key);
    }
}

/// A store keeping one file per key inside a directory.
///
/// Each key maps to a file named after the hex SHA-256 digest of the key, so
/// any string of any length is a valid key. Values survive process restarts.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (and creates, if missing) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(StoreError::from)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Some(value),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                tracing::warn!(error = ?err, key, "failed to read store entry");
                None
            }
        }
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        fs::write(self.path(key), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) {
        if let Err(err) = fs::remove_file(self.path(key)) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(error = ?err, key, "failed to remove store entry");
            }
        }
    }
}
