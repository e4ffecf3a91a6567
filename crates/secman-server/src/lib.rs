//! `secman` HTTP server.
//!
//! Wires the core library, a storage backend and the built-in engines into
//! an Axum application serving the JSON API under `/api`.

pub mod config;
pub mod error;
pub mod hardening;
pub mod middleware;
pub mod routes;
pub mod state;

use std::sync::Arc;

use secman_core::Core;
use secman_core::barrier::SealConfig;
use secman_core::engines::{self, blobs::BlobStoreFactory};
use secman_core::error::CoreError;
use secman_storage::StorageBackend;

use crate::state::AppState;

/// Build a sealed core with every built-in engine registered.
///
/// # Errors
///
/// Returns an error if persisted core state cannot be read or an engine
/// fails to register.
pub async fn build_state(
    storage: Arc<dyn StorageBackend>,
    seal: SealConfig,
    blob_stores: Arc<dyn BlobStoreFactory>,
) -> Result<Arc<AppState>, CoreError> {
    let core = Core::new(storage, seal).await?;
    engines::register_builtin(&core, blob_stores).await?;
    Ok(Arc::new(AppState::new(core)))
}
