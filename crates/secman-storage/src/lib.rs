//! Physical storage for secman.
//!
//! This crate defines the [`StorageBackend`] trait, a raw key-value interface
//! that knows nothing about engines or encryption. The barrier in
//! `secman-core` wraps a backend so that every value is encrypted before it
//! reaches this layer.
//!
//! Two implementations are provided:
//!
//! - [`MemoryBackend`]: in-memory, the default and the one used by tests
//! - [`RocksDbBackend`]: persistent, backed by `RocksDB` (feature `rocksdb-backend`)

use std::time::Duration;

mod error;
mod memory;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// A raw record as it exists below the barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalEntry {
    /// Fully qualified storage path, e.g. `secrets/kv/db_password`.
    pub path: String,
    /// Opaque bytes, ciphertext for everything written by the barrier.
    pub value: Vec<u8>,
}

impl PhysicalEntry {
    /// Build an entry from a path and a value.
    pub fn new(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }
}

/// A pluggable key-value storage backend.
///
/// Paths are UTF-8 strings using `/` as a separator. Entries written with a
/// TTL disappear once it elapses: `get` returns `None` and `list` skips them.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve an entry by path.
    ///
    /// Returns `Ok(None)` if the path does not exist or has expired.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, path: &str) -> Result<Option<PhysicalEntry>, StorageError>;

    /// Store an entry, overwriting any existing value at the same path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, entry: &PhysicalEntry, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Delete a path. Deleting a missing path is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// List the paths of all live entries that start with `prefix`, in
    /// lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Check whether a path exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.get(path).await?.is_some())
    }
}
