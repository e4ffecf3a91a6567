//! Persisted core state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::barrier::BarrierStorage;
use crate::error::CoreError;

const CORE_PATH: &str = "sys/core";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CoreEntry {
    initialized: bool,
}

/// Reads and writes the `initialized` flag through the plaintext barrier.
#[derive(Clone)]
pub struct CoreRepository {
    storage: Arc<dyn BarrierStorage>,
}

impl CoreRepository {
    pub fn new(storage: Arc<dyn BarrierStorage>) -> Self {
        Self { storage }
    }

    /// Whether init has completed. A missing record means "no".
    ///
    /// # Errors
    ///
    /// Returns barrier or deserialization errors.
    pub async fn is_initialized(&self) -> Result<bool, CoreError> {
        Ok(self.entry().await?.initialized)
    }

    /// Persist the `initialized` flag.
    ///
    /// # Errors
    ///
    /// Returns barrier or serialization errors.
    pub async fn set_initialized(&self, initialized: bool) -> Result<(), CoreError> {
        let mut entry = self.entry().await?;
        entry.initialized = initialized;
        let value = serde_json::to_string(&entry)?;
        self.storage.update(CORE_PATH, &value, None).await?;
        Ok(())
    }

    async fn entry(&self) -> Result<CoreEntry, CoreError> {
        match self.storage.get_ok(CORE_PATH).await? {
            Some(entry) => Ok(serde_json::from_str(&entry.value)?),
            None => Ok(CoreEntry::default()),
        }
    }
}

impl std::fmt::Debug for CoreRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRepository").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::barrier::UnsealedBarrier;
    use secman_storage::MemoryBackend;

    #[tokio::test]
    async fn flag_defaults_to_false_and_persists() {
        let storage = Arc::new(MemoryBackend::new());
        let repo = CoreRepository::new(Arc::new(UnsealedBarrier::new(storage.clone())));
        assert!(!repo.is_initialized().await.unwrap());

        repo.set_initialized(true).await.unwrap();
        let reopened = CoreRepository::new(Arc::new(UnsealedBarrier::new(storage)));
        assert!(reopened.is_initialized().await.unwrap());
    }
}
