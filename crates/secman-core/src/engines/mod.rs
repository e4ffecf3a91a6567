//! Built-in engines.
//!
//! | Root path | Engine |
//! |---|---|
//! | `secrets/kv` | [`kv::KvBackend`] |
//! | `secrets/pci_dss` | [`pci_dss::PciDssBackend`] |
//! | `secrets/blobs` | [`blobs::BlobsBackend`] |
//! | `auth/logopass` | [`logopass::LogopassBackend`] |

pub mod blobs;
pub mod kv;
pub mod logopass;
pub mod pci_dss;

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::barrier::BarrierStorage;
use crate::core::Core;
use crate::crypto::random_bytes;
use crate::error::{CoreError, EngineError};
use crate::logical_storage::LogicalStorage;

use self::blobs::{BlobStoreFactory, BlobsBackend};
use self::kv::KvBackend;
use self::logopass::LogopassBackend;
use self::pci_dss::PciDssBackend;

/// Free-form string metadata attached to a secret.
pub type Metadata = BTreeMap<String, String>;

/// Body of the metadata update routes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataBody {
    pub metadata: Metadata,
}

/// Metadata records stored under `<engine>/metadata/<key>`.
#[derive(Debug, Clone)]
pub struct MetadataRepository {
    storage: LogicalStorage,
}

impl MetadataRepository {
    pub fn new(engine_storage: &LogicalStorage) -> Self {
        Self {
            storage: engine_storage.scoped("metadata"),
        }
    }

    /// # Errors
    ///
    /// Returns barrier or deserialization errors.
    pub async fn get(&self, key: &str) -> Result<Option<Metadata>, EngineError> {
        match self.storage.get_ok(key).await? {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// Returns barrier or serialization errors.
    pub async fn put(&self, key: &str, metadata: &Metadata) -> Result<(), EngineError> {
        let value = serde_json::to_string(metadata)?;
        self.storage.update(key, &value, None).await?;
        Ok(())
    }

    /// Merge `updates` into the existing record, returning the result, or
    /// `None` if there is no record to merge into.
    ///
    /// # Errors
    ///
    /// Returns barrier or serialization errors.
    pub async fn merge(&self, key: &str, updates: Metadata) -> Result<Option<Metadata>, EngineError> {
        let Some(mut metadata) = self.get(key).await? else {
            return Ok(None);
        };
        metadata.extend(updates);
        self.put(key, &metadata).await?;
        Ok(Some(metadata))
    }

    /// # Errors
    ///
    /// Returns barrier errors.
    pub async fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.storage.delete(key).await?;
        Ok(())
    }
}

/// Current time in RFC 3339 with second precision.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// 64 random bytes, URL-safe base64 without padding, so the token is a
/// single path segment.
pub fn random_token() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes(64))
}

/// Register every built-in engine on `core`.
///
/// # Errors
///
/// Returns a router error if a root path is already taken.
pub async fn register_builtin(
    core: &Core,
    blob_stores: Arc<dyn BlobStoreFactory>,
) -> Result<(), CoreError> {
    core.register(Arc::new(KvBackend::new(core.storage(kv::ROOT_PATH))))
        .await?;
    core.register(Arc::new(PciDssBackend::new(core.storage(pci_dss::ROOT_PATH))))
        .await?;
    core.register(Arc::new(BlobsBackend::new(
        core.storage(blobs::ROOT_PATH),
        blob_stores,
    )))
    .await?;
    core.register(Arc::new(LogopassBackend::new(
        core.storage(logopass::ROOT_PATH),
        core.iam(),
    )))
    .await?;
    Ok(())
}
