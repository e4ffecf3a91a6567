//! Users and sessions.
//!
//! Users are stored at `sys/users/<login>` with an argon2 password hash.
//! Sessions are stored at `sys/sessions/<id>` with a storage TTL matching
//! their lifetime, and carry an explicit expiry that [`IamCore::authorize`]
//! checks on every use.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::barrier::BarrierStorage;
use crate::error::IamError;
use crate::logical_storage::LogicalStorage;

/// A registered user.
#[derive(Clone, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("login", &self.login)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Subject the session was issued to.
    pub sub: String,
    /// Engine that issued the session.
    pub engine: String,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expired_at
    }
}

/// User and session management on the encrypted barrier.
pub struct IamCore {
    users: LogicalStorage,
    sessions: LogicalStorage,
    register_lock: Mutex<()>,
}

fn hash_password(password: &str) -> Result<String, IamError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| IamError::PasswordHash {
            reason: e.to_string(),
        })
}

fn verify_password(password: &str, hash: &str) -> Result<bool, IamError> {
    let parsed = PasswordHash::new(hash).map_err(|e| IamError::PasswordHash {
        reason: e.to_string(),
    })?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

impl IamCore {
    pub fn new(barrier: Arc<dyn BarrierStorage>) -> Self {
        Self {
            users: LogicalStorage::new(Arc::clone(&barrier), "sys/users"),
            sessions: LogicalStorage::new(barrier, "sys/sessions"),
            register_lock: Mutex::new(()),
        }
    }

    async fn user(&self, login: &str) -> Result<Option<User>, IamError> {
        match self.users.get_ok(login).await? {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Create a user.
    ///
    /// # Errors
    ///
    /// Returns [`IamError::UserAlreadyExists`] if `login` is taken.
    pub async fn register(&self, login: &str, password: &str) -> Result<User, IamError> {
        let _guard = self.register_lock.lock().await;
        if self.user(login).await?.is_some() {
            return Err(IamError::UserAlreadyExists {
                login: login.to_owned(),
            });
        }
        let user = User {
            login: login.to_owned(),
            password_hash: hash_password(password)?,
            created_at: Utc::now(),
        };
        self.users
            .update(login, &serde_json::to_string(&user)?, None)
            .await?;
        info!(login, "user registered");
        Ok(user)
    }

    /// Check a login and password.
    ///
    /// # Errors
    ///
    /// Returns [`IamError::InvalidCredentials`] for an unknown login or a
    /// wrong password.
    pub async fn authenticate(&self, login: &str, password: &str) -> Result<User, IamError> {
        let user = self
            .user(login)
            .await?
            .ok_or(IamError::InvalidCredentials)?;
        if !verify_password(password, &user.password_hash)? {
            debug!(login, "password mismatch");
            return Err(IamError::InvalidCredentials);
        }
        Ok(user)
    }

    /// Issue a session for `sub` lasting `ttl`.
    ///
    /// # Errors
    ///
    /// Returns barrier or serialization errors.
    pub async fn login(&self, sub: &str, engine: &str, ttl: Duration) -> Result<Session, IamError> {
        let created_at = Utc::now();
        let lifetime = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let session = Session {
            id: Uuid::new_v4().to_string(),
            sub: sub.to_owned(),
            engine: engine.to_owned(),
            created_at,
            expired_at: created_at
                .checked_add_signed(lifetime)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        self.sessions
            .update(&session.id, &serde_json::to_string(&session)?, Some(ttl))
            .await?;
        Ok(session)
    }

    /// Look up a live session.
    ///
    /// # Errors
    ///
    /// Returns [`IamError::SessionNotFound`] or [`IamError::SessionExpired`].
    pub async fn authorize(&self, session_id: &str) -> Result<Session, IamError> {
        let entry = self
            .sessions
            .get_ok(session_id)
            .await?
            .ok_or(IamError::SessionNotFound)?;
        let session: Session = serde_json::from_str(&entry.value)?;
        if session.is_expired(Utc::now()) {
            return Err(IamError::SessionExpired);
        }
        Ok(session)
    }

    /// Drop a session.
    ///
    /// # Errors
    ///
    /// Returns barrier errors.
    pub async fn logout(&self, session_id: &str) -> Result<(), IamError> {
        self.sessions.delete(session_id).await?;
        Ok(())
    }
}

impl fmt::Debug for IamCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IamCore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use secman_storage::MemoryBackend;

    use super::*;
    use crate::barrier::UnsealedBarrier;

    fn iam() -> IamCore {
        IamCore::new(Arc::new(UnsealedBarrier::new(Arc::new(MemoryBackend::new()))))
    }

    #[tokio::test]
    async fn register_then_authenticate() {
        let iam = iam();
        let user = iam.register("alice", "hunter2").await.unwrap();
        assert!(user.password_hash.starts_with("$argon2"));

        assert_eq!(iam.authenticate("alice", "hunter2").await.unwrap().login, "alice");
        assert!(matches!(
            iam.authenticate("alice", "wrong").await,
            Err(IamError::InvalidCredentials)
        ));
        assert!(matches!(
            iam.authenticate("bob", "hunter2").await,
            Err(IamError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn duplicate_login_is_rejected() {
        let iam = iam();
        iam.register("alice", "a").await.unwrap();
        assert!(matches!(
            iam.register("alice", "b").await,
            Err(IamError::UserAlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let iam = iam();
        let session = iam
            .login("alice", "logopass", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(session.engine, "logopass");
        assert_eq!(iam.authorize(&session.id).await.unwrap(), session);

        iam.logout(&session.id).await.unwrap();
        assert!(matches!(
            iam.authorize(&session.id).await,
            Err(IamError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn zero_ttl_session_is_expired() {
        let iam = iam();
        let session = iam.login("alice", "logopass", Duration::ZERO).await.unwrap();
        assert!(iam.authorize(&session.id).await.is_err());
    }

    #[test]
    fn debug_hides_password_hash() {
        let user = User {
            login: "alice".to_owned(),
            password_hash: "$argon2id$secret".to_owned(),
            created_at: Utc::now(),
        };
        assert!(!format!("{user:?}").contains("secret"));
    }
}
