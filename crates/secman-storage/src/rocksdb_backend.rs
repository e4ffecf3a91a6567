//! `RocksDB` storage backend.
//!
//! All operations run on the blocking pool via
//! [`tokio::task::spawn_blocking`] since `RocksDB` is a synchronous C++
//! library. Every stored value is prefixed with an 8-byte big-endian expiry
//! deadline in unix milliseconds, zero meaning "never expires".

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rocksdb::{DBWithThreadMode, MultiThreaded, Options};

use crate::{PhysicalEntry, StorageBackend, StorageError};

type Db = DBWithThreadMode<MultiThreaded>;

const HEADER_LEN: usize = 8;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn encode(value: &[u8], ttl: Option<Duration>) -> Vec<u8> {
    let deadline = ttl.map_or(0, |ttl| {
        now_millis().saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    });
    let mut out = Vec::with_capacity(HEADER_LEN + value.len());
    out.extend_from_slice(&deadline.to_be_bytes());
    out.extend_from_slice(value);
    out
}

/// Returns the payload if the record is still live.
fn decode(raw: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
    let (header, payload) = raw
        .split_first_chunk::<HEADER_LEN>()
        .ok_or_else(|| StorageError::InvalidKey {
            reason: format!("record shorter than {HEADER_LEN}-byte header"),
        })?;
    let deadline = u64::from_be_bytes(*header);
    if deadline != 0 && deadline <= now_millis() {
        return Ok(None);
    }
    Ok(Some(payload.to_vec()))
}

/// A storage backend backed by `RocksDB`.
///
/// # Examples
///
/// ```no_run
/// # use secman_storage::RocksDbBackend;
/// let backend = RocksDbBackend::open("/var/lib/secman/data").unwrap();
/// ```
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<Db>,
    path: PathBuf,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    /// Open a `RocksDB` database at the given path, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if `RocksDB` fails to open or create the
    /// database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = Db::open(&opts, path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }
}

#[async_trait::async_trait]
impl StorageBackend for RocksDbBackend {
    async fn get(&self, path: &str) -> Result<Option<PhysicalEntry>, StorageError> {
        let db = Arc::clone(&self.db);
        let path = path.to_owned();
        tokio::task::spawn_blocking(move || {
            let raw = db.get(path.as_bytes()).map_err(|e| StorageError::Read {
                key: path.clone(),
                reason: e.to_string(),
            })?;
            match raw {
                Some(raw) => Ok(decode(&raw)?.map(|value| PhysicalEntry { path, value })),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| StorageError::Read {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn put(&self, entry: &PhysicalEntry, ttl: Option<Duration>) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let key = entry.path.clone();
        let value = encode(&entry.value, ttl);
        tokio::task::spawn_blocking(move || {
            db.put(key.as_bytes(), &value)
                .map_err(|e| StorageError::Write {
                    key,
                    reason: e.to_string(),
                })
        })
        .await
        .map_err(|e| StorageError::Write {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let key = path.to_owned();
        tokio::task::spawn_blocking(move || {
            db.delete(key.as_bytes()).map_err(|e| StorageError::Delete {
                key,
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Delete {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let db = Arc::clone(&self.db);
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || {
            let iter = db.iterator(rocksdb::IteratorMode::From(
                prefix.as_bytes(),
                rocksdb::Direction::Forward,
            ));

            let mut keys = Vec::new();
            for item in iter {
                let (k, v) = item.map_err(|e| StorageError::List {
                    prefix: prefix.clone(),
                    reason: e.to_string(),
                })?;
                let key = String::from_utf8(k.to_vec()).map_err(|e| StorageError::InvalidKey {
                    reason: e.to_string(),
                })?;
                if !key.starts_with(&prefix) {
                    break;
                }
                if decode(&v)?.is_some() {
                    keys.push(key);
                }
            }
            Ok(keys)
        })
        .await
        .map_err(|e| StorageError::List {
            prefix: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = RocksDbBackend::open(dir.path()).unwrap();
            backend
                .put(&PhysicalEntry::new("sys/core", b"{}".to_vec()), None)
                .await
                .unwrap();
        }
        let backend = RocksDbBackend::open(dir.path()).unwrap();
        let entry = backend.get("sys/core").await.unwrap().unwrap();
        assert_eq!(entry.value, b"{}");
    }

    #[test]
    fn expired_record_decodes_to_none() {
        let mut raw = 1u64.to_be_bytes().to_vec();
        raw.extend_from_slice(b"x");
        assert_eq!(decode(&raw).unwrap(), None);
        assert_eq!(decode(&encode(b"x", None)).unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn truncated_record_is_rejected() {
        assert!(decode(&[0, 1]).is_err());
    }
}
