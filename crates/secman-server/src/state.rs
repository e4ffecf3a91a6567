//! Shared application state for the `secman` server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`.

use secman_core::Core;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Barrier, routers, auth and engines.
    pub core: Core,
}

impl AppState {
    pub fn new(core: Core) -> Self {
        Self { core }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").field("core", &self.core).finish()
    }
}
