//! Root tokens.
//!
//! A root token bypasses every auth engine. Only `SHA-256(token)` is stored,
//! in the plaintext barrier so it can be checked while sealed (unseal itself
//! requires authentication). The token is shown once, at init.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::barrier::BarrierStorage;
use crate::crypto::random_bytes;
use crate::error::{BarrierError, TokenError};
use crate::logical_storage::LogicalStorage;

/// Key of the token generated at init.
pub const ROOT_TOKEN_KEY: &str = "root";

const TOKEN_BYTES: usize = 32;

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Generates and verifies root tokens.
#[derive(Clone)]
pub struct RootTokens {
    storage: LogicalStorage,
}

impl RootTokens {
    /// Store token hashes under `sys/tokens` of `barrier`.
    pub fn new(barrier: Arc<dyn BarrierStorage>) -> Self {
        Self {
            storage: LogicalStorage::new(barrier, "sys/tokens"),
        }
    }

    /// Generate a token under `key`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] if the hash cannot be stored.
    pub async fn r#gen(&self, key: &str) -> Result<String, TokenError> {
        let token = BASE64.encode(random_bytes(TOKEN_BYTES));
        self.storage.update(key, &hash_token(&token), None).await?;
        info!(key, "root token generated");
        Ok(token)
    }

    /// Check `token` against the hash stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::NotFound`] if no token was generated under `key`.
    pub async fn compare(&self, key: &str, token: &str) -> Result<bool, TokenError> {
        let stored = match self.storage.get(key).await {
            Ok(entry) => entry.value,
            Err(BarrierError::EntryNotFound { .. }) => {
                return Err(TokenError::NotFound {
                    key: key.to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let candidate = hash_token(token);
        Ok(candidate.as_bytes().ct_eq(stored.as_bytes()).into())
    }
}

impl fmt::Debug for RootTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootTokens").finish_non_exhaustive()
    }
}
