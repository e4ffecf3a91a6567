//! Engine dispatch: `ANY /api/engine/*path`.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Request, State};

use secman_core::backend::{LogicalRequest, Method};

use super::{EngineResponse, json_body};
use crate::error::AppError;
use crate::middleware::{logical_headers, logical_path};
use crate::state::AppState;

/// Translate the HTTP request and hand it to the engine owning its path.
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<EngineResponse, AppError> {
    let (parts, body) = req.into_parts();
    let method = Method::from_str(parts.method.as_str()).map_err(AppError::BadRequest)?;

    let mut logical = LogicalRequest::new(method, &logical_path(parts.uri.path()));
    for (name, value) in logical_headers(&parts.headers) {
        logical = logical.with_header(&name, &value);
    }
    if let Some(body) = json_body(body).await? {
        logical = logical.with_body(body);
    }

    Ok(EngineResponse(state.core.handle(logical).await?))
}
