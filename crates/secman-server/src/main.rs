//! `secman` server entry point.
//!
//! Hardens the process, opens the storage backend, builds a sealed core with
//! the built-in engines and serves the API until SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use secman_core::engines::blobs::{BlobStoreFactory, MemoryBlobStoreFactory};
use secman_server::config::{BlobStoreType, ServerConfig, StorageBackendType};
use secman_server::{build_state, hardening, routes};
use secman_storage::{MemoryBackend, StorageBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Before any key material is loaded.
    let hardening_failures = hardening::harden(config.disable_mlock);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    for failure in &hardening_failures {
        warn!(error = %failure, "process hardening incomplete");
    }
    if config.disable_mlock {
        warn!("mlock disabled via SECMAN_DISABLE_MLOCK, secrets may be swapped to disk");
    }

    let seal = config
        .seal()
        .map_err(anyhow::Error::msg)
        .context("invalid SECMAN_UNSEAL_SHARES / SECMAN_UNSEAL_THRESHOLD")?;
    info!(storage = ?config.storage_backend, blob_store = ?config.blob_store, "secman starting");

    let storage = open_storage(&config)?;
    let state = build_state(storage, seal, blob_stores(&config)?)
        .await
        .context("failed to build core")?;
    let app = routes::router(state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "secman listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("secman stopped");
    Ok(())
}

fn open_storage(config: &ServerConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageBackendType::RocksDb { path } => {
            info!(path = %path, "using RocksDB storage");
            Ok(Arc::new(
                secman_storage::RocksDbBackend::open(path).context("failed to open RocksDB storage")?,
            ))
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageBackendType::RocksDb { .. } => {
            anyhow::bail!("RocksDB backend requested but feature 'rocksdb-backend' is not enabled")
        }
    }
}

fn blob_stores(config: &ServerConfig) -> anyhow::Result<Arc<dyn BlobStoreFactory>> {
    match config.blob_store {
        BlobStoreType::Memory => {
            warn!("blobs engine uses in-memory object storage");
            Ok(Arc::new(MemoryBlobStoreFactory::new()))
        }
        #[cfg(feature = "s3")]
        BlobStoreType::S3 => Ok(Arc::new(secman_core::engines::blobs::S3BlobStoreFactory::new(
            config.blob_region.clone(),
        ))),
        #[cfg(not(feature = "s3"))]
        BlobStoreType::S3 => anyhow::bail!("S3 blob store requested but feature 's3' is not enabled"),
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
}
