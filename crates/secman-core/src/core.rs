//! The core lifecycle.
//!
//! [`Core`] owns the barriers, the logical router, the auth subsystem and
//! the root token store. It moves through three states:
//!
//! ```text
//! Uninitialized --init--> Sealed --unseal (threshold shares)--> Unsealed
//! ```
//!
//! Both transitions run under one mutex. An unseal only clears the sealed
//! flag after every enabled engine and every auth engine has been restored;
//! if any of them fails the barrier is sealed again and the error returned.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use secman_storage::StorageBackend;

use crate::auth::Auth;
use crate::backend::{Backend, LogicalRequest, LogicalResponse};
use crate::barrier::{Aes256Barrier, Barrier, BarrierStorage, SealConfig, UnsealProgress, UnsealedBarrier};
use crate::core_repository::CoreRepository;
use crate::error::{AuthError, BarrierError, CoreError, RouterError};
use crate::iam::IamCore;
use crate::logical_router::LogicalRouter;
use crate::logical_storage::LogicalStorage;
use crate::root_token::{ROOT_TOKEN_KEY, RootTokens};

/// Header carrying a root token.
pub const TOKEN_HEADER: &str = "x-secman-token";

/// Returned once by [`Core::init`].
#[derive(Clone, Serialize)]
pub struct InitResult {
    pub root_token: String,
    /// Base64 encoded unseal shares.
    pub thresholds: Vec<String>,
}

impl fmt::Debug for InitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitResult")
            .field("root_token", &"[REDACTED]")
            .field("thresholds", &self.thresholds.len())
            .finish()
    }
}

/// Outcome of one unseal call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnsealStatus {
    pub sealed: bool,
    pub progress: UnsealProgress,
}

/// Snapshot reported by `/sys/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreStatus {
    pub initialized: bool,
    pub sealed: bool,
    pub barrier: String,
}

/// The secret manager.
pub struct Core {
    barrier: Arc<Aes256Barrier>,
    router: LogicalRouter,
    auth: Auth,
    root_tokens: RootTokens,
    repository: CoreRepository,
    iam: Arc<IamCore>,
    initialized: AtomicBool,
    sealed: AtomicBool,
    transition: Mutex<()>,
}

impl Core {
    /// Build a sealed core over `storage`.
    ///
    /// `seal` only applies if the store has never been initialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted core state cannot be read.
    pub async fn new(storage: Arc<dyn StorageBackend>, seal: SealConfig) -> Result<Self, CoreError> {
        let plain: Arc<dyn BarrierStorage> = Arc::new(UnsealedBarrier::new(Arc::clone(&storage)));
        let barrier = Arc::new(Aes256Barrier::new(storage, seal));
        let encrypted: Arc<dyn BarrierStorage> = barrier.clone();

        let repository = CoreRepository::new(Arc::clone(&plain));
        let initialized = repository.is_initialized().await?;
        info!(initialized, "core loaded");

        Ok(Self {
            router: LogicalRouter::new(Arc::clone(&encrypted)),
            auth: Auth::new(Arc::clone(&encrypted)),
            iam: Arc::new(IamCore::new(encrypted)),
            root_tokens: RootTokens::new(plain),
            repository,
            barrier,
            initialized: AtomicBool::new(initialized),
            sealed: AtomicBool::new(true),
            transition: Mutex::new(()),
        })
    }

    /// A storage view rooted at `prefix` on the encrypted barrier.
    pub fn storage(&self, prefix: &str) -> LogicalStorage {
        let barrier: Arc<dyn BarrierStorage> = self.barrier.clone();
        LogicalStorage::new(barrier, prefix)
    }

    /// Shared user and session store for auth engines.
    pub fn iam(&self) -> Arc<IamCore> {
        Arc::clone(&self.iam)
    }

    pub fn router(&self) -> &LogicalRouter {
        &self.router
    }

    /// Register an engine. Engines are registered once, before serving.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::EngineAlreadyRegistered`] for a taken root path.
    pub async fn register(&self, backend: Arc<dyn Backend>) -> Result<(), CoreError> {
        self.router.register(backend).await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Initialize the barrier and generate the root token.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyInitialized`] on a second call. If the
    /// root token or the initialized flag cannot be written, the barrier key
    /// material is removed again so init can be retried.
    pub async fn init(&self) -> Result<InitResult, CoreError> {
        let _guard = self.transition.lock().await;
        if self.is_initialized() {
            return Err(CoreError::AlreadyInitialized);
        }

        let shares = self.barrier.init().await.map_err(|e| match e {
            BarrierError::AlreadyInitialized => CoreError::AlreadyInitialized,
            other => other.into(),
        })?;
        let root_token = match self.finish_init().await {
            Ok(token) => token,
            Err(e) => {
                error!(error = %e, "init failed, removing barrier keys");
                if let Err(reset) = self.barrier.reset().await {
                    error!(error = %reset, "barrier reset failed");
                }
                return Err(e);
            }
        };
        self.initialized.store(true, Ordering::SeqCst);
        info!(shares = shares.len(), "core initialized");

        Ok(InitResult {
            root_token,
            thresholds: shares.iter().map(|share| BASE64.encode(share)).collect(),
        })
    }

    async fn finish_init(&self) -> Result<String, CoreError> {
        let root_token = self.root_tokens.r#gen(ROOT_TOKEN_KEY).await?;
        self.repository.set_initialized(true).await?;
        Ok(root_token)
    }

    /// Submit one unseal share.
    ///
    /// A share below the threshold is not an error: the returned status
    /// stays sealed and reports progress.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotInitialized`], [`CoreError::AlreadyUnsealed`],
    /// a barrier error for a rejected share, or [`CoreError::PostUnseal`]
    /// if an engine failed to restore. In that case every engine is unloaded
    /// and the barrier sealed again.
    pub async fn unseal(&self, share: &[u8]) -> Result<UnsealStatus, CoreError> {
        let _guard = self.transition.lock().await;
        if !self.is_initialized() {
            return Err(CoreError::NotInitialized);
        }
        if !self.is_sealed() {
            return Err(CoreError::AlreadyUnsealed);
        }

        if self.barrier.unseal(share).await? {
            if let Err(e) = self.post_unseal().await {
                error!(error = %e, "post-unseal failed, sealing barrier");
                self.auth.unload().await;
                self.router.unload_engines().await;
                self.barrier.seal().await;
                return Err(CoreError::PostUnseal(Box::new(e)));
            }
            self.sealed.store(false, Ordering::SeqCst);
            info!("core unsealed");
        }

        Ok(UnsealStatus {
            sealed: self.is_sealed(),
            progress: self.barrier.progress().await,
        })
    }

    async fn post_unseal(&self) -> Result<(), CoreError> {
        self.router.post_unseal_engines().await?;
        self.auth.post_unseal(&self.router).await?;
        Ok(())
    }

    pub async fn status(&self) -> CoreStatus {
        CoreStatus {
            initialized: self.is_initialized(),
            sealed: self.is_sealed(),
            barrier: self.barrier.info().await,
        }
    }

    /// Authorize a request by root token or through the auth engines.
    ///
    /// Requests to routes an engine declares as public pass without
    /// credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthorized`] wrapped in [`CoreError::Auth`] if
    /// no credential is accepted.
    pub async fn authorize(&self, req: &LogicalRequest) -> Result<(), CoreError> {
        if let Some(token) = req.header(TOKEN_HEADER) {
            if self.root_tokens.compare(ROOT_TOKEN_KEY, token).await? {
                return Ok(());
            }
            warn!(path = %req.path, "invalid root token");
            return Err(AuthError::Unauthorized.into());
        }

        if let Ok(backend) = self.router.resolve(&req.path).await {
            let public = match backend.router().await {
                Some(router) => router.skips_auth(req.method, &req.path),
                None => false,
            };
            if public {
                return Ok(());
            }
        }

        self.auth.authorize(req).await?;
        Ok(())
    }

    async fn resolve_root(&self, path: &str) -> Result<Arc<dyn Backend>, CoreError> {
        let path = path.trim_matches('/');
        let backend = self.router.resolve(path).await?;
        if backend.root_path().trim_matches('/') != path {
            return Err(RouterError::EngineNotFound {
                path: path.to_owned(),
            }
            .into());
        }
        Ok(backend)
    }

    /// Enable the engine mounted exactly at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::EngineNotFound`] for an unknown path, or the
    /// engine's error.
    pub async fn enable_engine(
        &self,
        path: &str,
        req: &LogicalRequest,
    ) -> Result<LogicalResponse, CoreError> {
        let backend = self.resolve_root(path).await?;
        Ok(self.router.enable_engine(&backend, req).await?)
    }

    /// Allow the engine mounted at `path` to authenticate requests.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::EngineNotFound`] for an unknown path and
    /// [`AuthError::NotAuthorizeBackend`] for an engine that cannot
    /// authorize, and [`AuthError::EngineNotEnabled`] for an auth engine whose
    /// own enable has not run.
    pub async fn enable_auth(&self, path: &str) -> Result<(), CoreError> {
        let backend = self.resolve_root(path).await?;
        let root = backend.root_path().to_owned();
        if Arc::clone(&backend).authorizer().is_none() {
            return Err(AuthError::NotAuthorizeBackend { path: root }.into());
        }
        if backend.router().await.is_none() {
            return Err(AuthError::EngineNotEnabled { path: root }.into());
        }
        self.auth.enable_engine(backend).await?;
        Ok(())
    }

    /// Dispatch an engine request.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::EngineNotFound`] if no engine owns the path,
    /// or the handler's error.
    pub async fn handle(&self, req: LogicalRequest) -> Result<LogicalResponse, CoreError> {
        let backend = self.router.resolve(&req.path).await?;
        let Some(router) = backend.router().await else {
            return Ok(LogicalResponse::not_found("engine is not enabled"));
        };
        Ok(router
            .handle(req)
            .await?
            .unwrap_or_else(|| LogicalResponse::not_found("route not found")))
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("initialized", &self.is_initialized())
            .field("sealed", &self.is_sealed())
            .finish_non_exhaustive()
    }
}
