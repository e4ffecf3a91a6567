//! Cryptographic primitives.
//!
//! Provides AES-256-GCM authenticated encryption, zeroize-on-drop key
//! newtypes, and the [`Keyring`] that the barrier uses to encrypt entries.
//!
//! # Formats
//!
//! - [`encrypt`]: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! - [`Keyring::encrypt`]: `term (u32 BE) || nonce || ciphertext || tag`, so
//!   a reader can pick the key an entry was written under.

use std::collections::BTreeMap;
use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Nonce length for AES-256-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// Minimum ciphertext length: 12-byte nonce + 16-byte AES-GCM tag.
const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + 16;

/// Width of the key term prefix written by [`Keyring::encrypt`].
const TERM_LEN: usize = 4;

/// A 256-bit encryption key that is zeroized on drop.
///
/// The inner bytes are never exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes. The caller must not log or persist them.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Fill a fresh buffer with `len` bytes from the OS CSPRNG.
#[must_use]
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Encrypt plaintext using AES-256-GCM with a fresh random nonce.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Decrypt ciphertext produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] if the input cannot hold a
/// nonce and a tag, and [`CryptoError::Decryption`] if authentication fails.
pub fn decrypt(key: &EncryptionKey, combined: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

/// The set of data encryption keys, indexed by term.
///
/// New writes always use the active term. Older terms stay available so
/// entries written before a rotation remain readable.
#[derive(Clone)]
pub struct Keyring {
    active_term: u32,
    keys: BTreeMap<u32, EncryptionKey>,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyringRecord {
    active_term: u32,
    keys: Vec<KeyRecord>,
}

#[derive(Serialize, Deserialize, Zeroize)]
struct KeyRecord {
    term: u32,
    key: String,
}

impl Keyring {
    /// Create a keyring holding a single freshly generated key at term 1.
    #[must_use]
    pub fn generate() -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(1, EncryptionKey::generate());
        Self {
            active_term: 1,
            keys,
        }
    }

    /// The term used for new writes.
    #[must_use]
    pub fn active_term(&self) -> u32 {
        self.active_term
    }

    /// Add a new key and make it active.
    pub fn rotate(&mut self) -> u32 {
        self.active_term = self.active_term.saturating_add(1);
        self.keys.insert(self.active_term, EncryptionKey::generate());
        self.active_term
    }

    /// Encrypt with the active key, prefixing the term.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownKeyTerm`] if the active key is missing or
    /// [`CryptoError::Encryption`] if the AEAD operation fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .keys
            .get(&self.active_term)
            .ok_or(CryptoError::UnknownKeyTerm {
                term: self.active_term,
            })?;
        let sealed = encrypt(key, plaintext)?;
        let mut out = Vec::with_capacity(TERM_LEN.saturating_add(sealed.len()));
        out.extend_from_slice(&self.active_term.to_be_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt a value produced by [`Keyring::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CiphertextTooShort`] on truncated input,
    /// [`CryptoError::UnknownKeyTerm`] if the term is not in the keyring, and
    /// [`CryptoError::Decryption`] if authentication fails.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (term, sealed) =
            data.split_first_chunk::<TERM_LEN>()
                .ok_or(CryptoError::CiphertextTooShort {
                    expected: TERM_LEN + MIN_CIPHERTEXT_LEN,
                    actual: data.len(),
                })?;
        let term = u32::from_be_bytes(*term);
        let key = self
            .keys
            .get(&term)
            .ok_or(CryptoError::UnknownKeyTerm { term })?;
        decrypt(key, sealed)
    }

    /// Serialize the keyring and encrypt it under `root_key`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if serialization or encryption fails.
    pub fn seal(&self, root_key: &EncryptionKey) -> Result<Vec<u8>, CryptoError> {
        let record = KeyringRecord {
            active_term: self.active_term,
            keys: self
                .keys
                .iter()
                .map(|(term, key)| KeyRecord {
                    term: *term,
                    key: BASE64.encode(key.as_bytes()),
                })
                .collect(),
        };
        let mut json = serde_json::to_vec(&record).map_err(|e| CryptoError::Encryption {
            reason: format!("failed to serialize keyring: {e}"),
        })?;
        let sealed = encrypt(root_key, &json);
        json.zeroize();
        sealed
    }

    /// Decrypt a keyring produced by [`Keyring::seal`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] if `root_key` is wrong or the
    /// record is corrupted.
    pub fn open(root_key: &EncryptionKey, sealed: &[u8]) -> Result<Self, CryptoError> {
        let mut json = decrypt(root_key, sealed)?;
        let parsed = serde_json::from_slice::<KeyringRecord>(&json);
        json.zeroize();
        let record = parsed.map_err(|e| CryptoError::Decryption {
            reason: format!("malformed keyring: {e}"),
        })?;

        let mut keys = BTreeMap::new();
        for KeyRecord { term, key } in &record.keys {
            let mut raw = BASE64
                .decode(key)
                .map_err(|e| CryptoError::Decryption {
                    reason: format!("malformed key for term {term}: {e}"),
                })?;
            let bytes: Result<[u8; 32], _> = raw.as_slice().try_into();
            raw.zeroize();
            let bytes = bytes.map_err(|_| CryptoError::Decryption {
                reason: format!("key for term {term} is not 32 bytes"),
            })?;
            keys.insert(*term, EncryptionKey::from_bytes(bytes));
        }

        Ok(Self {
            active_term: record.active_term,
            keys,
        })
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("active_term", &self.active_term)
            .field("terms", &self.keys.len())
            .finish()
    }
}
