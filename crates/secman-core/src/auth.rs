//! Authentication through auth engines.
//!
//! [`Auth`] keeps the list of engines allowed to authenticate requests. The
//! list is persisted at `sys/auth` and re-resolved against the logical
//! router after every unseal.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::backend::{AuthorizeBackend, Backend, LogicalRequest};
use crate::barrier::BarrierStorage;
use crate::error::AuthError;
use crate::logical_router::LogicalRouter;

const AUTH_PATH: &str = "sys/auth";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct AuthConfig {
    engines: Vec<String>,
}

struct AuthEngine {
    path: String,
    authorizer: Arc<dyn AuthorizeBackend>,
}

/// The set of enabled auth engines.
pub struct Auth {
    storage: Arc<dyn BarrierStorage>,
    engines: RwLock<Vec<AuthEngine>>,
}

fn authorizer_of(backend: Arc<dyn Backend>) -> Result<Arc<dyn AuthorizeBackend>, AuthError> {
    let path = backend.root_path().to_owned();
    backend
        .authorizer()
        .ok_or(AuthError::NotAuthorizeBackend { path })
}

impl Auth {
    /// `storage` must be the encrypted barrier.
    pub fn new(storage: Arc<dyn BarrierStorage>) -> Self {
        Self {
            storage,
            engines: RwLock::new(Vec::new()),
        }
    }

    async fn load_config(&self) -> Result<Option<AuthConfig>, AuthError> {
        match self.storage.get_ok(AUTH_PATH).await? {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
            None => Ok(None),
        }
    }

    async fn save_config(&self, config: &AuthConfig) -> Result<(), AuthError> {
        let value = serde_json::to_string(config)?;
        self.storage.update(AUTH_PATH, &value, None).await?;
        Ok(())
    }

    /// Reload the enabled auth engines after an unseal.
    ///
    /// # Errors
    ///
    /// Fails if the configuration cannot be read or a listed engine cannot
    /// be resolved or cannot authorize.
    pub async fn post_unseal(&self, router: &LogicalRouter) -> Result<(), AuthError> {
        let mut engines = self.engines.write().await;
        let Some(config) = self.load_config().await? else {
            self.save_config(&AuthConfig::default()).await?;
            engines.clear();
            return Ok(());
        };

        let mut restored = Vec::with_capacity(config.engines.len());
        for path in config.engines {
            let backend = router.resolve(&path).await?;
            restored.push(AuthEngine {
                authorizer: authorizer_of(backend)?,
                path,
            });
        }
        *engines = restored;
        info!(count = engines.len(), "auth engines restored");
        Ok(())
    }

    /// Allow `backend` to authenticate requests. Enabling twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotAuthorizeBackend`] if the engine cannot
    /// authorize, or a barrier error if the configuration cannot be saved.
    pub async fn enable_engine(&self, backend: Arc<dyn Backend>) -> Result<(), AuthError> {
        let path = backend.root_path().trim_matches('/').to_owned();
        let authorizer = authorizer_of(backend)?;

        let mut engines = self.engines.write().await;
        if engines.iter().any(|engine| engine.path == path) {
            return Ok(());
        }
        let mut config = self.load_config().await?.unwrap_or_default();
        if !config.engines.contains(&path) {
            config.engines.push(path.clone());
        }
        self.save_config(&config).await?;
        info!(engine = %path, "auth engine enabled");
        engines.push(AuthEngine { path, authorizer });
        Ok(())
    }

    /// Ask each auth engine in order.
    ///
    /// # Errors
    ///
    /// Returns the first engine error, or [`AuthError::Unauthorized`] if no
    /// engine accepts the request.
    pub async fn authorize(&self, req: &LogicalRequest) -> Result<(), AuthError> {
        let engines = self.engines.read().await;
        for engine in engines.iter() {
            if engine.authorizer.authorize(req).await? {
                return Ok(());
            }
        }
        Err(AuthError::Unauthorized)
    }

    /// Drop the in-memory engine list until the next unseal.
    pub async fn unload(&self) {
        self.engines.write().await.clear();
    }

    /// Paths of the enabled auth engines.
    pub async fn engines(&self) -> Vec<String> {
        self.engines
            .read()
            .await
            .iter()
            .map(|engine| engine.path.clone())
            .collect()
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use secman_storage::MemoryBackend;

    use super::*;
    use crate::backend::{LogicalResponse, Method, Paths};
    use crate::backend_router::BackendRouter;
    use crate::barrier::UnsealedBarrier;
    use crate::error::EngineError;
    use crate::logical_router::tests::StubBackend;

    /// Accepts requests carrying `x-test: <secret>`.
    struct HeaderAuth {
        root: &'static str,
        secret: &'static str,
    }

    #[async_trait]
    impl Backend for HeaderAuth {
        fn root_path(&self) -> &'static str {
            self.root
        }
        fn help(&self) -> &'static str {
            "header auth"
        }
        fn paths(&self) -> Paths {
            Paths::new()
        }
        async fn enable(&self, _req: &LogicalRequest) -> Result<LogicalResponse, EngineError> {
            Ok(LogicalResponse::message(200, "enabled"))
        }
        async fn post_unseal(&self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn router(&self) -> Option<Arc<BackendRouter>> {
            None
        }
        async fn set_router(&self, _router: Arc<BackendRouter>) {}
        async fn unload(&self) {}
        fn authorizer(self: Arc<Self>) -> Option<Arc<dyn AuthorizeBackend>> {
            Some(self)
        }
    }

    #[async_trait]
    impl AuthorizeBackend for HeaderAuth {
        async fn authorize(&self, req: &LogicalRequest) -> Result<bool, EngineError> {
            Ok(req.header("x-test") == Some(self.secret))
        }
    }

    fn storage() -> Arc<dyn BarrierStorage> {
        Arc::new(UnsealedBarrier::new(Arc::new(MemoryBackend::new())))
    }

    fn request(secret: &str) -> LogicalRequest {
        LogicalRequest::new(Method::Get, "/secrets/kv").with_header("x-test", secret)
    }

    #[tokio::test]
    async fn no_engines_means_unauthorized() {
        let auth = Auth::new(storage());
        assert!(matches!(
            auth.authorize(&request("s")).await,
            Err(AuthError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn enabled_engine_authorizes() {
        let auth = Auth::new(storage());
        auth.enable_engine(Arc::new(HeaderAuth { root: "auth/header", secret: "s" }))
            .await
            .unwrap();
        auth.authorize(&request("s")).await.unwrap();
        assert!(auth.authorize(&request("wrong")).await.is_err());
    }

    #[tokio::test]
    async fn non_auth_engine_is_rejected() {
        let auth = Auth::new(storage());
        assert!(matches!(
            auth.enable_engine(Arc::new(StubBackend::new("secrets/kv"))).await,
            Err(AuthError::NotAuthorizeBackend { .. })
        ));
    }

    #[tokio::test]
    async fn post_unseal_restores_persisted_engines() {
        let storage = storage();
        let router = LogicalRouter::new(Arc::clone(&storage));
        let engine: Arc<dyn Backend> = Arc::new(HeaderAuth { root: "auth/header", secret: "s" });
        router.register(Arc::clone(&engine)).await.unwrap();

        let auth = Auth::new(Arc::clone(&storage));
        auth.enable_engine(Arc::clone(&engine)).await.unwrap();
        auth.enable_engine(engine).await.unwrap();

        let restored = Auth::new(storage);
        restored.post_unseal(&router).await.unwrap();
        assert_eq!(restored.engines().await, vec!["auth/header"]);
        restored.authorize(&request("s")).await.unwrap();
    }

    #[tokio::test]
    async fn post_unseal_without_config_creates_empty_one() {
        let storage = storage();
        let router = LogicalRouter::new(Arc::clone(&storage));
        let auth = Auth::new(Arc::clone(&storage));
        auth.post_unseal(&router).await.unwrap();

        assert!(storage.get_ok(AUTH_PATH).await.unwrap().is_some());
        assert!(auth.engines().await.is_empty());
    }
}
