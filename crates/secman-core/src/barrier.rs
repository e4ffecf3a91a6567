//! Storage barriers.
//!
//! Every byte an engine persists passes through a barrier. The
//! [`Aes256Barrier`] encrypts values with the keyring before they reach the
//! storage backend and refuses all data-plane operations with
//! [`BarrierError::Sealed`] until enough Shamir shares have been supplied to
//! recover the root key. The [`UnsealedBarrier`] is a plaintext pass-through
//! for the few records that must be readable while sealed.
//!
//! # Layout
//!
//! - `sys/seal/config`: share count and threshold, stored raw.
//! - `sys/keyring`: the keyring, encrypted under the root key, stored raw.
//! - everything else: `term || nonce || ciphertext || tag`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sharks::{Share, Sharks};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use secman_storage::{PhysicalEntry, StorageBackend};

use crate::crypto::{EncryptionKey, Keyring};
use crate::error::BarrierError;

const SEAL_CONFIG_PATH: &str = "sys/seal/config";
const KEYRING_PATH: &str = "sys/keyring";

/// A logical record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    /// Path relative to the storage view that returned the entry.
    pub key: String,
    /// Fully qualified storage path.
    pub path: String,
    /// Plaintext value.
    pub value: String,
    /// Lifetime requested when the entry was written, if any.
    pub ttl: Option<Duration>,
}

/// Data-plane operations shared by barriers and logical storage views.
#[async_trait]
pub trait BarrierStorage: Send + Sync {
    /// Read an entry, failing with [`BarrierError::EntryNotFound`] if absent.
    async fn get(&self, path: &str) -> Result<Entry, BarrierError> {
        self.get_ok(path)
            .await?
            .ok_or_else(|| BarrierError::EntryNotFound {
                path: path.to_owned(),
            })
    }

    /// Read an entry, returning `None` if absent.
    async fn get_ok(&self, path: &str) -> Result<Option<Entry>, BarrierError>;

    /// Write `value` at `path`, replacing any previous value.
    async fn update(
        &self,
        path: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BarrierError>;

    /// Delete the entry at `path`. Missing entries are not an error.
    async fn delete(&self, path: &str) -> Result<(), BarrierError>;

    /// Every entry whose path starts with `prefix`, ordered by path.
    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, BarrierError>;
}

/// Unseal progress as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnsealProgress {
    /// Distinct shares collected so far.
    pub collected: u8,
    /// Shares required to unseal.
    pub threshold: u8,
}

/// A barrier with a seal lifecycle.
#[async_trait]
pub trait Barrier: BarrierStorage {
    /// Create the key material and return the shares needed to unseal.
    async fn init(&self) -> Result<Vec<Vec<u8>>, BarrierError>;

    /// Submit one share. Returns `true` once the barrier is unsealed and
    /// `false` while more shares are needed.
    async fn unseal(&self, share: &[u8]) -> Result<bool, BarrierError>;

    /// Drop the in-memory key material and any pending shares.
    async fn seal(&self);

    /// Whether data-plane operations are currently refused.
    async fn is_sealed(&self) -> bool;

    /// How far a pending unseal has progressed.
    async fn progress(&self) -> UnsealProgress;

    /// Short human readable description of the barrier state.
    async fn info(&self) -> String;
}

/// Shamir configuration persisted at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealConfig {
    /// Number of shares generated.
    pub shares: u8,
    /// Shares required to recover the root key.
    pub threshold: u8,
}

impl SealConfig {
    /// Validate a share count and threshold.
    ///
    /// # Errors
    ///
    /// Returns a description of the violated bound.
    pub fn new(shares: u8, threshold: u8) -> Result<Self, String> {
        if shares == 0 {
            return Err("shares must be at least 1".to_owned());
        }
        if threshold == 0 || threshold > shares {
            return Err(format!("threshold must be between 1 and {shares}"));
        }
        if shares > 1 && threshold < 2 {
            return Err("threshold must be at least 2 when more than one share is generated".to_owned());
        }
        Ok(Self { shares, threshold })
    }
}

impl Default for SealConfig {
    fn default() -> Self {
        Self {
            shares: 5,
            threshold: 3,
        }
    }
}

/// Shares collected during a progressive unseal.
///
/// Duplicate submissions are ignored so one operator cannot reach the
/// threshold alone. The buffer is wiped on every outcome other than
/// "need more shares".
#[derive(Default, Zeroize, ZeroizeOnDrop)]
pub struct ShareBuffer {
    shares: Vec<Vec<u8>>,
}

impl ShareBuffer {
    /// Add a share, returning `false` if it was already collected.
    pub fn push(&mut self, share: &[u8]) -> bool {
        if self.shares.iter().any(|s| s.as_slice() == share) {
            return false;
        }
        self.shares.push(share.to_vec());
        true
    }

    /// Number of distinct shares collected.
    pub fn len(&self) -> usize {
        self.shares.len()
    }

    /// Whether no share has been collected.
    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    /// Wipe every collected share.
    pub fn clear(&mut self) {
        self.shares.zeroize();
    }

    /// Combine the collected shares into the root key.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::InvalidShare`] for malformed shares and
    /// [`BarrierError::RecoveryFailed`] if the shares do not combine into a
    /// 256-bit key.
    pub fn combine(&self, threshold: u8) -> Result<EncryptionKey, BarrierError> {
        let parsed = self
            .shares
            .iter()
            .map(|bytes| {
                Share::try_from(bytes.as_slice()).map_err(|e| BarrierError::InvalidShare {
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<Share>, _>>()?;

        let mut secret = Sharks(threshold)
            .recover(&parsed)
            .map_err(|e| BarrierError::RecoveryFailed {
                reason: e.to_string(),
            })?;
        let bytes: Result<[u8; 32], _> = secret.as_slice().try_into();
        secret.zeroize();
        bytes
            .map(EncryptionKey::from_bytes)
            .map_err(|_| BarrierError::RecoveryFailed {
                reason: "recovered key is not 32 bytes".to_owned(),
            })
    }
}

impl fmt::Debug for ShareBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareBuffer")
            .field("collected", &self.shares.len())
            .finish()
    }
}

/// AES-256-GCM barrier unlocked by Shamir shares of the root key.
pub struct Aes256Barrier {
    storage: Arc<dyn StorageBackend>,
    config: SealConfig,
    keyring: RwLock<Option<Keyring>>,
    shares: Mutex<ShareBuffer>,
}

impl Aes256Barrier {
    /// Create a sealed barrier. `config` is only used by [`Barrier::init`];
    /// an initialized store keeps the configuration it was created with.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, config: SealConfig) -> Self {
        Self {
            storage,
            config,
            keyring: RwLock::new(None),
            shares: Mutex::new(ShareBuffer::default()),
        }
    }

    /// Remove the key material written by [`Barrier::init`], returning the
    /// store to its uninitialized state. The keyring goes first so a partial
    /// reset still allows a fresh init.
    ///
    /// # Errors
    ///
    /// Returns a storage error if either entry cannot be deleted.
    pub async fn reset(&self) -> Result<(), BarrierError> {
        self.seal().await;
        self.storage.delete(KEYRING_PATH).await?;
        self.storage.delete(SEAL_CONFIG_PATH).await?;
        warn!("barrier reset to uninitialized");
        Ok(())
    }

    async fn keyring(&self) -> Result<Keyring, BarrierError> {
        self.keyring.read().await.clone().ok_or(BarrierError::Sealed)
    }

    async fn stored_config(&self) -> Result<Option<SealConfig>, BarrierError> {
        let Some(entry) = self.storage.get(SEAL_CONFIG_PATH).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&entry.value)
            .map(Some)
            .map_err(|e| BarrierError::Encoding {
                path: SEAL_CONFIG_PATH.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn open_keyring(&self, root_key: &EncryptionKey) -> Result<Keyring, BarrierError> {
        let sealed = self
            .storage
            .get(KEYRING_PATH)
            .await?
            .ok_or(BarrierError::NotInitialized)?;
        Keyring::open(root_key, &sealed.value).map_err(|e| BarrierError::RecoveryFailed {
            reason: e.to_string(),
        })
    }

    fn decode(keyring: &Keyring, entry: &PhysicalEntry) -> Result<Entry, BarrierError> {
        let plaintext = keyring.decrypt(&entry.value)?;
        let value = String::from_utf8(plaintext).map_err(|e| BarrierError::Encoding {
            path: entry.path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Entry {
            key: entry.path.clone(),
            path: entry.path.clone(),
            value,
            ttl: None,
        })
    }
}

#[async_trait]
impl BarrierStorage for Aes256Barrier {
    async fn get_ok(&self, path: &str) -> Result<Option<Entry>, BarrierError> {
        let keyring = self.keyring().await?;
        match self.storage.get(path).await? {
            Some(raw) => Self::decode(&keyring, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        path: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BarrierError> {
        let keyring = self.keyring().await?;
        let ciphertext = keyring.encrypt(value.as_bytes())?;
        self.storage
            .put(&PhysicalEntry::new(path, ciphertext), ttl)
            .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), BarrierError> {
        let _keyring = self.keyring().await?;
        self.storage.delete(path).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, BarrierError> {
        let keyring = self.keyring().await?;
        let mut entries = Vec::new();
        for path in self.storage.list(prefix).await? {
            // An entry may expire or be deleted between list and get.
            if let Some(raw) = self.storage.get(&path).await? {
                entries.push(Self::decode(&keyring, &raw)?);
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl Barrier for Aes256Barrier {
    async fn init(&self) -> Result<Vec<Vec<u8>>, BarrierError> {
        if self.storage.exists(KEYRING_PATH).await? {
            return Err(BarrierError::AlreadyInitialized);
        }

        let root_key = EncryptionKey::generate();
        let keyring = Keyring::generate();
        let sealed_keyring = keyring.seal(&root_key)?;

        let dealer = Sharks(self.config.threshold).dealer(root_key.as_bytes());
        let shares: Vec<Vec<u8>> = dealer
            .take(usize::from(self.config.shares))
            .map(|share| Vec::from(&share))
            .collect();

        let config = serde_json::to_vec(&self.config).map_err(|e| BarrierError::Encoding {
            path: SEAL_CONFIG_PATH.to_owned(),
            reason: e.to_string(),
        })?;
        self.storage
            .put(&PhysicalEntry::new(SEAL_CONFIG_PATH, config), None)
            .await?;
        self.storage
            .put(&PhysicalEntry::new(KEYRING_PATH, sealed_keyring), None)
            .await?;

        info!(
            shares = self.config.shares,
            threshold = self.config.threshold,
            "barrier initialized"
        );
        Ok(shares)
    }

    async fn unseal(&self, share: &[u8]) -> Result<bool, BarrierError> {
        if self.keyring.read().await.is_some() {
            return Err(BarrierError::AlreadyUnsealed);
        }
        if share.is_empty() {
            return Err(BarrierError::InvalidShare {
                reason: "share is empty".to_owned(),
            });
        }
        let config = self
            .stored_config()
            .await?
            .ok_or(BarrierError::NotInitialized)?;

        let mut buffer = self.shares.lock().await;
        if !buffer.push(share) {
            warn!("duplicate unseal share ignored");
        }
        if buffer.len() < usize::from(config.threshold) {
            return Ok(false);
        }

        let root_key = match buffer.combine(config.threshold) {
            Ok(key) => key,
            Err(e) => {
                buffer.clear();
                return Err(e);
            }
        };
        let keyring = match self.open_keyring(&root_key).await {
            Ok(keyring) => keyring,
            Err(e) => {
                buffer.clear();
                return Err(e);
            }
        };
        buffer.clear();

        *self.keyring.write().await = Some(keyring);
        info!("barrier unsealed");
        Ok(true)
    }

    async fn seal(&self) {
        self.shares.lock().await.clear();
        if self.keyring.write().await.take().is_some() {
            info!("barrier sealed");
        }
    }

    async fn is_sealed(&self) -> bool {
        self.keyring.read().await.is_none()
    }

    async fn progress(&self) -> UnsealProgress {
        let collected = u8::try_from(self.shares.lock().await.len()).unwrap_or(u8::MAX);
        let threshold = match self.stored_config().await {
            Ok(Some(config)) => config.threshold,
            _ => self.config.threshold,
        };
        UnsealProgress {
            collected,
            threshold,
        }
    }

    async fn info(&self) -> String {
        let progress = self.progress().await;
        format!(
            "AES256 SSS keys: {}/{}",
            progress.collected, progress.threshold
        )
    }
}

impl fmt::Debug for Aes256Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aes256Barrier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Plaintext barrier that is always unsealed.
///
/// Holds records the server needs before the root key is available, such as
/// the initialization flag and the root token hash.
#[derive(Clone)]
pub struct UnsealedBarrier {
    storage: Arc<dyn StorageBackend>,
}

impl UnsealedBarrier {
    /// Wrap a storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    fn decode(entry: PhysicalEntry) -> Result<Entry, BarrierError> {
        let value = String::from_utf8(entry.value).map_err(|e| BarrierError::Encoding {
            path: entry.path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Entry {
            key: entry.path.clone(),
            path: entry.path,
            value,
            ttl: None,
        })
    }
}

#[async_trait]
impl BarrierStorage for UnsealedBarrier {
    async fn get_ok(&self, path: &str) -> Result<Option<Entry>, BarrierError> {
        self.storage.get(path).await?.map(Self::decode).transpose()
    }

    async fn update(
        &self,
        path: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BarrierError> {
        self.storage
            .put(&PhysicalEntry::new(path, value.as_bytes()), ttl)
            .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), BarrierError> {
        self.storage.delete(path).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, BarrierError> {
        let mut entries = Vec::new();
        for path in self.storage.list(prefix).await? {
            if let Some(raw) = self.storage.get(&path).await? {
                entries.push(Self::decode(raw)?);
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl Barrier for UnsealedBarrier {
    async fn init(&self) -> Result<Vec<Vec<u8>>, BarrierError> {
        Ok(Vec::new())
    }

    async fn unseal(&self, _share: &[u8]) -> Result<bool, BarrierError> {
        Ok(true)
    }

    async fn seal(&self) {}

    async fn is_sealed(&self) -> bool {
        false
    }

    async fn progress(&self) -> UnsealProgress {
        UnsealProgress {
            collected: 0,
            threshold: 0,
        }
    }

    async fn info(&self) -> String {
        "unsealed pass-through barrier".to_owned()
    }
}

impl fmt::Debug for UnsealedBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealedBarrier").finish_non_exhaustive()
    }
}
