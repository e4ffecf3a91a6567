//! Error types for `secman-core`.
//!
//! Each variant carries enough context to diagnose the problem without a
//! debugger. Crypto errors never include key material, and engine errors
//! never include secret values.

use secman_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// Ciphertext is too short to contain a term, a nonce and a tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// The ciphertext was written under a key term the keyring does not hold.
    #[error("unknown key term {term}")]
    UnknownKeyTerm { term: u32 },
}

/// Errors from the storage barriers.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The barrier is sealed and cannot encrypt or decrypt.
    #[error("barrier is sealed")]
    Sealed,

    /// The requested entry does not exist.
    #[error("entry not found at '{path}'")]
    EntryNotFound { path: String },

    /// `init` was called on a barrier that already has a keyring.
    #[error("barrier is already initialized")]
    AlreadyInitialized,

    /// `unseal` was called before `init`.
    #[error("barrier is not initialized")]
    NotInitialized,

    /// `unseal` was called on an unsealed barrier.
    #[error("barrier is already unsealed")]
    AlreadyUnsealed,

    /// A submitted key share was malformed.
    #[error("invalid key share: {reason}")]
    InvalidShare { reason: String },

    /// Shamir recovery or keyring decryption failed with the collected shares.
    #[error("root key recovery failed: {reason}")]
    RecoveryFailed { reason: String },

    /// A stored record could not be decoded.
    #[error("failed to decode entry at '{path}': {reason}")]
    Encoding { path: String, reason: String },

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the logical and backend routers.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// No engine is registered under the requested path.
    #[error("engine not found for path '{path}'")]
    EngineNotFound { path: String },

    /// An engine is already registered at this root path.
    #[error("engine already registered at '{path}'")]
    EngineAlreadyRegistered { path: String },

    /// A route pattern could not be compiled.
    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The router's persisted state could not be read or written.
    #[error("router storage error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from object storage used by the blobs engine.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    /// The adapter could not be configured.
    #[error("blob store configuration error: {reason}")]
    Config { reason: String },

    /// The object does not exist.
    #[error("blob '{key}' not found")]
    NotFound { key: String },

    /// The object store rejected or failed a request.
    #[error("blob store request for '{key}' failed: {reason}")]
    Request { key: String, reason: String },
}

/// Errors from identity and session management.
#[derive(Debug, thiserror::Error)]
pub enum IamError {
    /// A user with this login is already registered.
    #[error("user '{login}' already exists")]
    UserAlreadyExists { login: String },

    /// The login is unknown or the password does not match.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// No session exists under this id.
    #[error("session not found")]
    SessionNotFound,

    /// The session exists but its lifetime has elapsed.
    #[error("session expired")]
    SessionExpired,

    /// Password hashing failed.
    #[error("password hashing failed: {reason}")]
    PasswordHash { reason: String },

    /// A stored record could not be encoded or decoded.
    #[error("iam serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The barrier returned an error.
    #[error("iam barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors raised by engines and their handlers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine has never been enabled, so it has no persisted params.
    #[error("engine '{engine}' is not enabled")]
    NotEnabled { engine: String },

    /// A client-facing failure that should be reported as a bad request.
    #[error("{message}")]
    LogicalResponse { message: String },

    /// A handler received a body or parameter of an unexpected shape.
    #[error("type cast error: expected {expected}: {reason}")]
    TypeCast { expected: String, reason: String },

    /// Serialization of persisted engine data failed.
    #[error("engine serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The barrier returned an error.
    #[error("engine barrier error: {0}")]
    Barrier(#[from] BarrierError),

    /// The router returned an error.
    #[error("engine router error: {0}")]
    Router(#[from] RouterError),

    /// The blob store returned an error.
    #[error("engine blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),

    /// IAM returned an error.
    #[error("engine iam error: {0}")]
    Iam(#[from] IamError),

    /// Any other internal failure.
    #[error("internal engine error: {reason}")]
    Internal { reason: String },
}

impl EngineError {
    /// Build a client-facing error that maps to `400 Bad Request`.
    pub fn logical(message: impl Into<String>) -> Self {
        Self::LogicalResponse {
            message: message.into(),
        }
    }
}

/// Errors from root token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// No root token has been generated under this key.
    #[error("root token '{key}' not found")]
    NotFound { key: String },

    /// The barrier returned an error.
    #[error("token barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the authentication subsystem.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credential was accepted.
    #[error("unauthorized")]
    Unauthorized,

    /// The engine at this path cannot authorize requests.
    #[error("engine at '{path}' is not an auth engine")]
    NotAuthorizeBackend { path: String },

    /// The auth engine at this path has not been enabled.
    #[error("engine at '{path}' is not enabled")]
    EngineNotEnabled { path: String },

    /// An auth engine failed while checking credentials.
    #[error("auth engine error: {0}")]
    Engine(#[from] EngineError),

    /// The router returned an error.
    #[error("auth router error: {0}")]
    Router(#[from] RouterError),

    /// The root token store returned an error.
    #[error("auth token error: {0}")]
    Token(#[from] TokenError),

    /// The auth configuration could not be encoded or decoded.
    #[error("auth serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The barrier returned an error.
    #[error("auth barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the core lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// `init` was already completed.
    #[error("core is already initialized")]
    AlreadyInitialized,

    /// The operation requires an initialized core.
    #[error("core is not initialized")]
    NotInitialized,

    /// `unseal` was called while the core is unsealed.
    #[error("core is already unsealed")]
    AlreadyUnsealed,

    /// The persisted core state could not be encoded or decoded.
    #[error("core serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The barrier returned an error.
    #[error("core barrier error: {0}")]
    Barrier(#[from] BarrierError),

    /// An engine failed during post-unseal recovery.
    #[error("core engine error: {0}")]
    Engine(#[from] EngineError),

    /// The auth subsystem failed.
    #[error("core auth error: {0}")]
    Auth(#[from] AuthError),

    /// The root token store failed.
    #[error("core token error: {0}")]
    Token(#[from] TokenError),

    /// The router failed.
    #[error("core router error: {0}")]
    Router(#[from] RouterError),

    /// Restoring engines after the barrier opened failed; the core stays sealed.
    #[error("post-unseal failed: {0}")]
    PostUnseal(#[source] Box<CoreError>),
}
