//! System routes: `/api/sys/*`
//!
//! Initialization, unsealing and turning engines on. Status and init are
//! public; unseal needs an initialized server and a credential; enabling
//! engines additionally needs the server unsealed.

use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use secman_core::backend::{LogicalRequest, Method};
use secman_core::{CoreStatus, InitResult, UnsealStatus};

use super::{EngineResponse, json_body};
use crate::error::AppError;
use crate::state::AppState;

/// Request body for `POST /api/sys/unseal`.
#[derive(Deserialize)]
pub struct UnsealRequest {
    /// Base64 encoded unseal share.
    pub key: String,
}

/// Request body for `POST /api/sys/auth/enable`.
#[derive(Debug, Deserialize)]
pub struct EnableAuthRequest {
    pub engine_path: String,
}

/// Current initialization and seal state.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<CoreStatus> {
    Json(state.core.status().await)
}

/// Initialize the barrier and issue the root token and unseal shares.
///
/// Returns `304` if the server is already initialized.
pub async fn init(State(state): State<Arc<AppState>>) -> Result<Json<InitResult>, AppError> {
    let result = state.core.init().await?;
    Ok(Json(result))
}

/// Submit one unseal share.
pub async fn unseal(
    State(state): State<Arc<AppState>>,
    body: Body,
) -> Result<Json<UnsealStatus>, AppError> {
    if !state.core.is_sealed() {
        return Err(AppError::NotModified);
    }

    let request = json_body(body)
        .await
        .ok()
        .flatten()
        .and_then(|body| serde_json::from_value::<UnsealRequest>(body).ok())
        .filter(|req| !req.key.is_empty())
        .ok_or_else(|| AppError::BadRequest("key is missing".to_owned()))?;
    let share = BASE64
        .decode(request.key.as_bytes())
        .map_err(|_| AppError::BadRequest("invalid key".to_owned()))?;

    let status = state.core.unseal(&share).await?;
    Ok(Json(status))
}

/// Enable the engine mounted at `engine_path`, passing the body through as
/// its configuration.
pub async fn enable_engine(
    State(state): State<Arc<AppState>>,
    Path(engine_path): Path<String>,
    body: Body,
) -> Result<EngineResponse, AppError> {
    let mut req = LogicalRequest::new(Method::Post, &engine_path);
    if let Some(body) = json_body(body).await? {
        req = req.with_body(body);
    }
    let res = state.core.enable_engine(&engine_path, &req).await?;
    if res.is_success() {
        info!(engine = %engine_path, "engine enabled");
    }
    Ok(EngineResponse(res))
}

/// Let an enabled engine authenticate requests.
pub async fn enable_auth(
    State(state): State<Arc<AppState>>,
    body: Body,
) -> Result<Json<Value>, AppError> {
    let request: EnableAuthRequest = json_body(body)
        .await?
        .ok_or_else(|| AppError::BadRequest("engine_path is required".to_owned()))
        .and_then(|body| {
            serde_json::from_value(body).map_err(|e| AppError::BadRequest(e.to_string()))
        })?;
    state.core.enable_auth(&request.engine_path).await?;
    info!(engine = %request.engine_path, "auth engine enabled");
    Ok(Json(json!({ "message": "auth enabled" })))
}
