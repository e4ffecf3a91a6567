//! Root-path resolution.
//!
//! The [`LogicalRouter`] keeps every registered engine in a radix tree keyed
//! by root path and resolves request paths by longest prefix on segment
//! boundaries. It also remembers which engines were enabled, so
//! [`LogicalRouter::post_unseal_engines`] can restore exactly those after an
//! unseal.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::backend::{Backend, LogicalRequest, LogicalResponse};
use crate::backend_router::BackendRouter;
use crate::barrier::BarrierStorage;
use crate::error::{EngineError, RouterError};
use crate::logical_storage::LogicalStorage;
use crate::radix::RadixTree;

const ENABLED_KEY: &str = "engines";

/// Top-level router from root paths to engines.
pub struct LogicalRouter {
    engines: RwLock<RadixTree<Arc<dyn Backend>>>,
    storage: LogicalStorage,
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

impl LogicalRouter {
    /// Create an empty router persisting its enabled set under `sys/router`.
    pub fn new(barrier: Arc<dyn BarrierStorage>) -> Self {
        Self {
            engines: RwLock::new(RadixTree::new()),
            storage: LogicalStorage::new(barrier, "sys/router"),
        }
    }

    /// Register an engine under its root path.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::EngineAlreadyRegistered`] if the root path is taken.
    pub async fn register(&self, backend: Arc<dyn Backend>) -> Result<(), RouterError> {
        let root = normalize(backend.root_path()).to_owned();
        let mut engines = self.engines.write().await;
        if engines.get(&root).is_some() {
            return Err(RouterError::EngineAlreadyRegistered { path: root });
        }
        engines.insert(&root, backend);
        info!(engine = %root, "engine registered");
        Ok(())
    }

    /// Resolve the engine owning `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::EngineNotFound`] if no root path is a prefix of
    /// `path` on a segment boundary.
    pub async fn resolve(&self, path: &str) -> Result<Arc<dyn Backend>, RouterError> {
        let path = normalize(path);
        let engines = self.engines.read().await;
        let mut candidate = path;
        while let Some((root, backend)) = engines.longest_prefix(candidate) {
            if root.is_empty() {
                break;
            }
            if path.len() == root.len() || path.as_bytes().get(root.len()) == Some(&b'/') {
                return Ok(Arc::clone(backend));
            }
            // `secrets/kv` must not own `secrets/kvx`: retry below that root.
            let end = root.char_indices().last().map_or(0, |(i, _)| i);
            candidate = &path[..end];
        }
        Err(RouterError::EngineNotFound {
            path: path.to_owned(),
        })
    }

    /// Root paths recorded as enabled.
    ///
    /// # Errors
    ///
    /// Returns barrier or deserialization errors.
    pub async fn enabled(&self) -> Result<BTreeSet<String>, EngineError> {
        match self.storage.get_ok(ENABLED_KEY).await? {
            Some(entry) => Ok(serde_json::from_str(&entry.value)?),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn record_enabled(&self, root: &str) -> Result<(), EngineError> {
        let mut enabled = self.enabled().await?;
        if enabled.insert(root.to_owned()) {
            let value = serde_json::to_string(&enabled)?;
            self.storage.update(ENABLED_KEY, &value, None).await?;
        }
        Ok(())
    }

    /// Enable `backend` and, on success, install its router.
    ///
    /// The engine's own response is returned unchanged, so `304` and `400`
    /// reach the caller as the engine produced them.
    ///
    /// # Errors
    ///
    /// Propagates engine and persistence errors.
    pub async fn enable_engine(
        &self,
        backend: &Arc<dyn Backend>,
        req: &LogicalRequest,
    ) -> Result<LogicalResponse, EngineError> {
        let resp = backend.enable(req).await?;
        if resp.is_success() {
            let router = BackendRouter::new(&backend.paths())?;
            backend.set_router(Arc::new(router)).await;
            self.record_enabled(normalize(backend.root_path())).await?;
            info!(engine = backend.root_path(), "engine enabled");
        }
        Ok(resp)
    }

    /// Restore every enabled engine after an unseal.
    ///
    /// # Errors
    ///
    /// The first failure aborts the sequence; the caller must stay sealed.
    pub async fn post_unseal_engines(&self) -> Result<(), EngineError> {
        for root in self.enabled().await? {
            let backend = self
                .engines
                .read()
                .await
                .get(&root)
                .cloned()
                .ok_or_else(|| RouterError::EngineNotFound { path: root.clone() })?;
            backend.post_unseal().await?;
            let router = BackendRouter::new(&backend.paths())?;
            backend.set_router(Arc::new(router)).await;
            info!(engine = %root, "engine restored");
        }
        Ok(())
    }

    /// Unload every registered engine, dropping params and routers.
    ///
    /// Undoes a partial [`LogicalRouter::post_unseal_engines`] before the
    /// barrier is sealed again.
    pub async fn unload_engines(&self) {
        let mut backends = Vec::new();
        self.engines
            .read()
            .await
            .walk(|_, backend| backends.push(Arc::clone(backend)));
        for backend in backends {
            backend.unload().await;
        }
    }
}

impl fmt::Debug for LogicalRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalRouter")
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}
