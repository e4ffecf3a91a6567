//! HTTP routes for `secman`.
//!
//! Everything sits under `/api`:
//! - `sys`: status, init, unseal, enabling engines and auth engines
//! - `engine`: dispatch of `/api/engine/*path` to the owning engine

pub mod engine;
pub mod sys;

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::header::{CACHE_CONTROL, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use secman_core::TOKEN_HEADER;
use secman_core::backend::{LogicalResponse, ResponseBody};

use crate::error::AppError;
use crate::middleware::{authorize, require_initialized, require_unsealed};
use crate::state::AppState;

/// Largest accepted request body. Blobs travel base64 encoded inside JSON.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// An engine response rendered as HTTP.
#[derive(Debug)]
pub struct EngineResponse(pub LogicalResponse);

impl IntoResponse for EngineResponse {
    fn into_response(self) -> Response {
        let LogicalResponse {
            status,
            body,
            headers,
        } = self.0;
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut res = match body {
            ResponseBody::Empty => status.into_response(),
            ResponseBody::Json(value) => (status, axum::Json(value)).into_response(),
            ResponseBody::Bytes(data) => (status, data).into_response(),
        };
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
                res.headers_mut().insert(name, value);
            }
        }
        res
    }
}

/// Read an optional JSON body. An empty body is `None`.
pub(crate) async fn json_body(body: Body) -> Result<Option<Value>, AppError> {
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| AppError::BadRequest(format!("cannot read body: {e}")))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|_| AppError::BadRequest("body is not valid JSON".to_owned()))
}

/// Build the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/api/sys/status", get(sys::status))
        .route("/api/sys/init", post(sys::init));

    // Available while sealed.
    let sealed = Router::new()
        .route("/api/sys/unseal", post(sys::unseal))
        .route_layer(from_fn_with_state(Arc::clone(&state), authorize))
        .route_layer(from_fn_with_state(Arc::clone(&state), require_initialized));

    let sys = public
        .merge(sealed)
        .layer(tower::limit::ConcurrencyLimitLayer::new(10));

    let unsealed = Router::new()
        .route("/api/sys/engines/enable/{*engine_path}", post(sys::enable_engine))
        .route("/api/sys/auth/enable", post(sys::enable_auth))
        .route("/api/engine/{*path}", any(engine::dispatch))
        .route_layer(from_fn_with_state(Arc::clone(&state), authorize))
        .route_layer(from_fn_with_state(Arc::clone(&state), require_unsealed))
        .route_layer(from_fn_with_state(Arc::clone(&state), require_initialized));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static(TOKEN_HEADER),
        ]);

    Router::new()
        .merge(sys)
        .merge(unsealed)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn engine_response_carries_headers_and_bytes() {
        let res = EngineResponse(
            LogicalResponse::bytes(b"abc".to_vec()).with_header("content-disposition", "attachment"),
        )
        .into_response();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["content-type"], "application/octet-stream");
        assert_eq!(res.headers()["content-disposition"], "attachment");
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"abc");
    }

    #[tokio::test]
    async fn engine_response_json() {
        let res = EngineResponse(LogicalResponse::not_found("key not found")).into_response();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({ "error": "key not found" }));
    }

    #[tokio::test]
    async fn empty_body_is_none() {
        assert!(json_body(Body::from("  ")).await.unwrap().is_none());
        assert!(json_body(Body::from("{\"a\":1}")).await.unwrap().is_some());
        assert!(json_body(Body::from("{")).await.is_err());
    }
}
