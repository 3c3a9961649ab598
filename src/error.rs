//! Error types shared across the crate.
//!
//! Only construction of infrastructure (clocks, persistent stores) can fail
//! from the caller's point of view. Cache failures are represented here but
//! never escape [`CacheStore`](crate::cache::CacheStore), and cancellation is
//! reported through the [`Cancelled`] marker rather than as an error state.

use std::io;

/// Top-level error for fallible constructors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The timer thread pool could not be created.
    #[error("failed to create timer thread pool: {0}")]
    Runtime(#[source] io::Error),

    /// The persistent store could not be opened.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Failure reported by a [`KeyValueStore`](crate::store::KeyValueStore) write.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying medium rejected the operation.
    #[error("store i/o error: {0}")]
    Io(#[from] io::Error),

    /// The store is full.
    #[error("store capacity of {capacity} entries exceeded")]
    CapacityExceeded { capacity: usize },
}

/// Failure while reading or writing a cache envelope.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache write failed: {0}")]
    Store(#[from] StoreError),

    #[error("cache entry could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Marker returned by a [`Cancellable`](crate::timing::Cancellable) future whose
/// token was signalled before the inner future finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("operation was cancelled")]
pub struct Cancelled;
