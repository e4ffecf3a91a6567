//! In-memory storage backend.
//!
//! Data lives in a `BTreeMap` behind a `RwLock` and is lost when the process
//! exits. Expired entries are hidden from reads immediately and dropped on the
//! next write, using a deadline index so a write only touches what expired.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{PhysicalEntry, StorageBackend, StorageError};

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

#[derive(Debug, Default)]
struct Entries {
    slots: BTreeMap<String, Slot>,
    deadlines: BTreeSet<(Instant, String)>,
}

impl Entries {
    fn purge_expired(&mut self, now: Instant) {
        while self.deadlines.first().is_some_and(|(deadline, _)| *deadline <= now) {
            if let Some((_, path)) = self.deadlines.pop_first() {
                self.slots.remove(&path);
            }
        }
    }

    fn remove(&mut self, path: &str) {
        if let Some(Slot {
            expires_at: Some(deadline),
            ..
        }) = self.slots.remove(path)
        {
            self.deadlines.remove(&(deadline, path.to_owned()));
        }
    }
}

/// An in-memory storage backend backed by a `BTreeMap`.
///
/// Clones share the same map, so one instance can be handed to several
/// barriers in tests.
///
/// # Examples
///
/// ```
/// # use secman_storage::{MemoryBackend, PhysicalEntry, StorageBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// backend.put(&PhysicalEntry::new("sys/core", b"data".to_vec()), None).await.unwrap();
/// let entry = backend.get("sys/core").await.unwrap().unwrap();
/// assert_eq!(entry.value, b"data");
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<Entries>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Option<PhysicalEntry>, StorageError> {
        let data = self.data.read().await;
        let now = Instant::now();
        Ok(data
            .slots
            .get(path)
            .filter(|slot| slot.is_live(now))
            .map(|slot| PhysicalEntry::new(path, slot.value.clone())))
    }

    async fn put(&self, entry: &PhysicalEntry, ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        let now = Instant::now();
        data.purge_expired(now);
        data.remove(&entry.path);

        let expires_at = ttl.map(|ttl| now + ttl);
        if let Some(deadline) = expires_at {
            data.deadlines.insert((deadline, entry.path.clone()));
        }
        data.slots.insert(
            entry.path.clone(),
            Slot {
                value: entry.value.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.data.write().await.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        let now = Instant::now();
        let keys = data
            .slots
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, slot)| slot.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(path: &str, value: &[u8]) -> PhysicalEntry {
        PhysicalEntry::new(path, value.to_vec())
    }

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("does/not/exist").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_overwrites_existing() {
        let backend = MemoryBackend::new();
        backend.put(&entry("key", b"v1"), None).await.unwrap();
        backend.put(&entry("key", b"v2"), None).await.unwrap();
        let got = backend.get("key").await.unwrap().unwrap();
        assert_eq!(got.value, b"v2");
        assert_eq!(got.path, "key");
    }

    #[tokio::test]
    async fn delete_nonexistent_is_noop() {
        let backend = MemoryBackend::new();
        backend.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn list_with_prefix() {
        let backend = MemoryBackend::new();
        backend.put(&entry("kv/data/a", b"1"), None).await.unwrap();
        backend.put(&entry("kv/data/b", b"2"), None).await.unwrap();
        backend.put(&entry("kv/metadata/a", b"3"), None).await.unwrap();
        backend.put(&entry("sys/core", b"4"), None).await.unwrap();

        let keys = backend.list("kv/data/").await.unwrap();
        assert_eq!(keys, vec!["kv/data/a", "kv/data/b"]);
    }

    #[tokio::test]
    async fn list_empty_prefix_returns_all() {
        let backend = MemoryBackend::new();
        backend.put(&entry("a", b"1"), None).await.unwrap();
        backend.put(&entry("b", b"2"), None).await.unwrap();
        assert_eq!(backend.list("").await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn ttl_entries_expire() {
        let backend = MemoryBackend::new();
        backend
            .put(&entry("sys/sessions/1", b"s"), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        backend.put(&entry("sys/sessions/2", b"s"), None).await.unwrap();
        assert!(backend.exists("sys/sessions/1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!backend.exists("sys/sessions/1").await.unwrap());
        assert_eq!(backend.list("sys/sessions/").await.unwrap(), vec!["sys/sessions/2"]);
    }

    #[tokio::test]
    async fn writes_drop_only_expired_entries() {
        let backend = MemoryBackend::new();
        let ttl = Some(Duration::from_millis(50));
        backend.put(&entry("sys/sessions/1", b"s"), ttl).await.unwrap();
        backend.put(&entry("sys/sessions/2", b"s"), Some(Duration::from_secs(60))).await.unwrap();
        backend.put(&entry("sys/sessions/1", b"renewed"), ttl).await.unwrap();
        assert_eq!(backend.data.read().await.deadlines.len(), 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        backend.put(&entry("sys/core", b"c"), None).await.unwrap();

        let data = backend.data.read().await;
        let paths: Vec<&String> = data.slots.keys().collect();
        assert_eq!(paths, vec!["sys/core", "sys/sessions/2"]);
        assert_eq!(data.deadlines.len(), 1);
    }

    #[tokio::test]
    async fn delete_forgets_deadline() {
        let backend = MemoryBackend::new();
        backend
            .put(&entry("sys/sessions/1", b"s"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        backend.delete("sys/sessions/1").await.unwrap();
        assert!(backend.data.read().await.deadlines.is_empty());
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.put(&entry("key", b"val"), None).await.unwrap();
        assert!(clone.exists("key").await.unwrap());
    }
}
