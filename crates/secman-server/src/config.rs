//! Server configuration for `secman`.
//!
//! Loads configuration from `SECMAN_*` environment variables. Unparseable
//! values fall back to their defaults; only the Shamir pair is validated
//! strictly, since a bad pair cannot be fixed after init.

use std::net::SocketAddr;

use secman_core::barrier::SealConfig;

const DEFAULT_BIND_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    8200,
);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend type.
    pub storage_backend: StorageBackendType,
    /// Log level filter, used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Shamir shares generated at init.
    pub unseal_shares: u8,
    /// Shares needed to unseal.
    pub unseal_threshold: u8,
    /// Object store behind the blobs engine.
    pub blob_store: BlobStoreType,
    /// S3 region for the blobs engine.
    pub blob_region: String,
    /// Whether to skip `mlock` (for development without root/`CAP_IPC_LOCK`).
    pub disable_mlock: bool,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// `RocksDB` persistent storage.
    RocksDb { path: String },
}

/// Supported blob stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobStoreType {
    /// Objects kept in process memory.
    Memory,
    /// An S3-compatible service configured per engine.
    S3,
}

impl BlobStoreType {
    const fn default_for_build() -> Self {
        if cfg!(feature = "s3") { Self::S3 } else { Self::Memory }
    }
}

fn flag(value: Option<String>) -> bool {
    value.is_some_and(|v| v == "true" || v == "1")
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SECMAN_BIND_ADDR` (default: `127.0.0.1:8200`)
    /// - `SECMAN_STORAGE`: `memory` or `rocksdb` (default: `memory`)
    /// - `SECMAN_STORAGE_PATH`: path for `rocksdb` (default: `./data`)
    /// - `SECMAN_LOG_LEVEL` (default: `info`)
    /// - `SECMAN_UNSEAL_SHARES` (default: `5`)
    /// - `SECMAN_UNSEAL_THRESHOLD` (default: `3`)
    /// - `SECMAN_BLOB_STORE`: `memory` or `s3` (default: `s3` if built with it)
    /// - `SECMAN_BLOB_REGION` (default: `us-east-1`)
    /// - `SECMAN_DISABLE_MLOCK` (default: `false`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = var("SECMAN_BIND_ADDR")
            .and_then(|addr| addr.parse().ok())
            .unwrap_or(DEFAULT_BIND_ADDR);

        let storage_path = var("SECMAN_STORAGE_PATH").unwrap_or_else(|| "./data".to_owned());
        let storage_backend = match var("SECMAN_STORAGE")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "rocksdb" => StorageBackendType::RocksDb { path: storage_path },
            _ => StorageBackendType::Memory,
        };

        let defaults = SealConfig::default();
        let unseal_shares = var("SECMAN_UNSEAL_SHARES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.shares);
        let unseal_threshold = var("SECMAN_UNSEAL_THRESHOLD")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.threshold);

        let blob_store = match var("SECMAN_BLOB_STORE").as_deref() {
            Some("memory") => BlobStoreType::Memory,
            Some("s3") => BlobStoreType::S3,
            _ => BlobStoreType::default_for_build(),
        };

        Self {
            bind_addr,
            storage_backend,
            log_level: var("SECMAN_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            unseal_shares,
            unseal_threshold,
            blob_store,
            blob_region: var("SECMAN_BLOB_REGION").unwrap_or_else(|| "us-east-1".to_owned()),
            disable_mlock: flag(var("SECMAN_DISABLE_MLOCK")),
        }
    }

    /// The validated Shamir configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the violated bound.
    pub fn seal(&self) -> Result<SealConfig, String> {
        SealConfig::new(self.unseal_shares, self.unseal_threshold)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.storage_backend, StorageBackendType::Memory);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.seal().unwrap(), SealConfig::default());
        assert_eq!(config.blob_region, "us-east-1");
        assert!(!config.disable_mlock);
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("SECMAN_BIND_ADDR", "0.0.0.0:9000"),
            ("SECMAN_STORAGE", "RocksDB"),
            ("SECMAN_STORAGE_PATH", "/var/lib/secman"),
            ("SECMAN_UNSEAL_SHARES", "3"),
            ("SECMAN_UNSEAL_THRESHOLD", "2"),
            ("SECMAN_BLOB_STORE", "memory"),
            ("SECMAN_DISABLE_MLOCK", "1"),
        ]);
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(
            config.storage_backend,
            StorageBackendType::RocksDb {
                path: "/var/lib/secman".to_owned()
            }
        );
        assert_eq!(config.seal().unwrap(), SealConfig::new(3, 2).unwrap());
        assert_eq!(config.blob_store, BlobStoreType::Memory);
        assert!(config.disable_mlock);
    }

    #[test]
    fn garbage_falls_back() {
        let config = load(&[("SECMAN_BIND_ADDR", "nowhere"), ("SECMAN_UNSEAL_SHARES", "many")]);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.unseal_shares, 5);
    }

    #[test]
    fn invalid_seal_pair_is_rejected() {
        let config = load(&[("SECMAN_UNSEAL_SHARES", "2"), ("SECMAN_UNSEAL_THRESHOLD", "3")]);
        assert!(config.seal().is_err());
    }
}
