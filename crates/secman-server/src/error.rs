//! HTTP error types for the `secman` server.
//!
//! Maps errors from `secman-core` into HTTP responses. Every variant except
//! [`AppError::NotModified`] produces a JSON body with a machine-readable
//! `error` field and a human-readable `message`. Internal failures are logged
//! and replaced with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use secman_core::error::{
    AuthError, BarrierError, BlobStoreError, CoreError, EngineError, IamError, RouterError,
    TokenError,
};

const INTERNAL_MESSAGE: &str = "internal server error, see logs for more details";

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// The server is sealed.
    Sealed,
    /// The server has not been initialized.
    NotInitialized,
    /// No credential was accepted.
    Unauthorized(String),
    /// Requested resource not found.
    NotFound(String),
    /// Client sent invalid input.
    BadRequest(String),
    /// The requested state transition already happened.
    NotModified,
    /// Internal server error. The cause is logged, never returned.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::NotModified => return StatusCode::NOT_MODIFIED.into_response(),
            Self::Sealed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "sealed",
                "server is sealed".to_owned(),
            ),
            Self::NotInitialized => (
                StatusCode::SERVICE_UNAVAILABLE,
                "not_initialized",
                "server is not initialized".to_owned(),
            ),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Internal(cause) => {
                error!(error = %cause, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    INTERNAL_MESSAGE.to_owned(),
                )
            }
        };

        (status, axum::Json(ErrorBody { error: error_type, message })).into_response()
    }
}

impl From<BarrierError> for AppError {
    fn from(err: BarrierError) -> Self {
        match err {
            BarrierError::Sealed => Self::Sealed,
            BarrierError::NotInitialized => Self::NotInitialized,
            BarrierError::AlreadyUnsealed | BarrierError::AlreadyInitialized => Self::NotModified,
            BarrierError::EntryNotFound { .. } => Self::NotFound(err.to_string()),
            BarrierError::InvalidShare { .. } | BarrierError::RecoveryFailed { .. } => {
                Self::BadRequest(err.to_string())
            }
            BarrierError::Encoding { .. } | BarrierError::Crypto(_) | BarrierError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<RouterError> for AppError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::EngineNotFound { .. } => Self::NotFound(err.to_string()),
            RouterError::Barrier(inner) => inner.into(),
            RouterError::EngineAlreadyRegistered { .. } | RouterError::InvalidPattern { .. } => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<BlobStoreError> for AppError {
    fn from(err: BlobStoreError) -> Self {
        match err {
            BlobStoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            BlobStoreError::Config { .. } | BlobStoreError::Request { .. } => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<IamError> for AppError {
    fn from(err: IamError) -> Self {
        match err {
            IamError::UserAlreadyExists { .. } => Self::BadRequest(err.to_string()),
            IamError::InvalidCredentials | IamError::SessionNotFound | IamError::SessionExpired => {
                Self::Unauthorized(err.to_string())
            }
            IamError::Barrier(inner) => inner.into(),
            IamError::PasswordHash { .. } | IamError::Serialization(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotEnabled { .. } => Self::NotFound(err.to_string()),
            EngineError::LogicalResponse { message } => Self::BadRequest(message),
            EngineError::Barrier(inner) => inner.into(),
            EngineError::Router(inner) => inner.into(),
            EngineError::BlobStore(inner) => inner.into(),
            EngineError::Iam(inner) => inner.into(),
            EngineError::TypeCast { .. }
            | EngineError::Serialization(_)
            | EngineError::Internal { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Barrier(inner) => inner.into(),
            TokenError::NotFound { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized => Self::Unauthorized("unauthorized".to_owned()),
            AuthError::NotAuthorizeBackend { .. } | AuthError::EngineNotEnabled { .. } => {
                Self::BadRequest(err.to_string())
            }
            AuthError::Engine(inner) => inner.into(),
            AuthError::Router(inner) => inner.into(),
            AuthError::Token(inner) => inner.into(),
            AuthError::Barrier(inner) => inner.into(),
            AuthError::Serialization(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AlreadyInitialized | CoreError::AlreadyUnsealed => Self::NotModified,
            CoreError::NotInitialized => Self::NotInitialized,
            CoreError::Barrier(inner) => inner.into(),
            CoreError::Engine(inner) => inner.into(),
            CoreError::Auth(inner) => inner.into(),
            CoreError::Token(inner) => inner.into(),
            CoreError::Router(inner) => inner.into(),
            CoreError::Serialization(_) | CoreError::PostUnseal(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}
