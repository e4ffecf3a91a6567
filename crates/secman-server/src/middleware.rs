//! Request gates for `secman`.
//!
//! Routes are layered with up to three gates, applied in this order:
//! [`require_initialized`], [`require_unsealed`] and [`authorize`]. The last
//! one accepts either the root token in `X-Secman-Token` or any credential an
//! enabled auth engine understands.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use secman_core::backend::{LogicalRequest, Method};

use crate::error::AppError;
use crate::state::AppState;

/// Prefix of the engine dispatch route.
pub const ENGINE_PREFIX: &str = "/api/engine";

/// The engine path a request addresses, or the raw path for system routes.
pub fn logical_path(path: &str) -> String {
    match path.strip_prefix(ENGINE_PREFIX) {
        Some(rest) if rest.is_empty() => "/".to_owned(),
        Some(rest) if rest.starts_with('/') => rest.to_owned(),
        _ => path.to_owned(),
    }
}

/// Lowercased header map for logical requests. Non-UTF-8 values are dropped.
pub fn logical_headers(headers: &HeaderMap) -> impl Iterator<Item = (String, String)> + '_ {
    headers.iter().filter_map(|(name, value)| {
        value
            .to_str()
            .ok()
            .map(|value| (name.as_str().to_ascii_lowercase(), value.to_owned()))
    })
}

/// Reject requests until the server is initialized.
pub async fn require_initialized(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if !state.core.is_initialized() {
        return AppError::NotInitialized.into_response();
    }
    next.run(req).await
}

/// Reject requests while the server is sealed.
pub async fn require_unsealed(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.core.is_sealed() {
        return AppError::Sealed.into_response();
    }
    next.run(req).await
}

/// Authorize the request through the core.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Ok(method) = Method::from_str(req.method().as_str()) else {
        return AppError::BadRequest(format!("unsupported method {}", req.method())).into_response();
    };
    let mut logical = LogicalRequest::new(method, &logical_path(req.uri().path()));
    for (name, value) in logical_headers(req.headers()) {
        logical = logical.with_header(&name, &value);
    }

    if let Err(e) = state.core.authorize(&logical).await {
        debug!(path = %logical.path, error = %e, "authorize failed");
        return AppError::from(e).into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_paths_are_stripped() {
        assert_eq!(logical_path("/api/engine/secrets/kv/a"), "/secrets/kv/a");
        assert_eq!(logical_path("/api/engine"), "/");
        assert_eq!(logical_path("/api/enginex/a"), "/api/enginex/a");
        assert_eq!(logical_path("/api/sys/unseal"), "/api/sys/unseal");
    }
}
