//! Prefix-scoped storage views.
//!
//! A [`LogicalStorage`] joins a fixed prefix onto every path before handing
//! it to the underlying barrier, and strips the prefix from the keys it
//! returns. Engines write through a view of their own root path, so they can
//! treat the whole keyspace as theirs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::barrier::{BarrierStorage, Entry};
use crate::error::BarrierError;

/// A storage handle confined to one prefix.
#[derive(Clone)]
pub struct LogicalStorage {
    barrier: Arc<dyn BarrierStorage>,
    prefix: String,
}

impl LogicalStorage {
    /// Create a view of `barrier` rooted at `prefix`.
    pub fn new(barrier: Arc<dyn BarrierStorage>, prefix: &str) -> Self {
        Self {
            barrier,
            prefix: join("", prefix),
        }
    }

    /// A view nested below this one.
    #[must_use]
    pub fn scoped(&self, prefix: &str) -> Self {
        Self {
            barrier: Arc::clone(&self.barrier),
            prefix: join(&self.prefix, prefix),
        }
    }

    /// The normalized prefix of this view.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn path(&self, key: &str) -> String {
        join(&self.prefix, key)
    }

    fn relative(&self, mut entry: Entry) -> Entry {
        let key = entry
            .path
            .strip_prefix(self.prefix.as_str())
            .unwrap_or(&entry.path);
        entry.key = key.trim_start_matches('/').to_owned();
        entry
    }
}

/// Join `key` onto `prefix` the way a filesystem path join would.
///
/// Empty and `.` segments are dropped, `..` only pops segments that came
/// from `key` so a view can never escape its prefix, and a trailing slash on
/// `key` is preserved for directory-style listing.
pub fn join(prefix: &str, key: &str) -> String {
    let mut relative: Vec<&str> = Vec::new();
    for segment in key.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                relative.pop();
            }
            other => relative.push(other),
        }
    }

    let mut out = prefix
        .split('/')
        .filter(|s| !s.is_empty())
        .chain(relative)
        .collect::<Vec<_>>()
        .join("/");
    if key.ends_with('/') && !out.is_empty() {
        out.push('/');
    }
    out
}

#[async_trait]
impl BarrierStorage for LogicalStorage {
    async fn get_ok(&self, key: &str) -> Result<Option<Entry>, BarrierError> {
        Ok(self
            .barrier
            .get_ok(&self.path(key))
            .await?
            .map(|entry| self.relative(entry)))
    }

    async fn update(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BarrierError> {
        self.barrier.update(&self.path(key), value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.barrier.delete(&self.path(key)).await
    }

    async fn list(&self, key: &str) -> Result<Vec<Entry>, BarrierError> {
        let entries = self.barrier.list(&self.path(key)).await?;
        Ok(entries
            .into_iter()
            .map(|entry| self.relative(entry))
            .collect())
    }
}

impl fmt::Debug for LogicalStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalStorage")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
