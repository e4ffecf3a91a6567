//! Object storage behind the blobs engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::BlobStoreError;

/// Bucket used when the enable request names none.
pub const DEFAULT_BUCKET: &str = "secrets-blobs";

/// Connection settings of an S3-compatible object store.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Adapter {
    /// Endpoint, with or without scheme.
    pub url: String,
    pub user: String,
    pub password: String,
    /// Use `https` when `url` has no scheme.
    pub ssl: bool,
    pub bucket: String,
}

impl S3Adapter {
    /// The endpoint as a full URL.
    pub fn endpoint(&self) -> String {
        if self.url.contains("://") {
            self.url.clone()
        } else if self.ssl {
            format!("https://{}", self.url)
        } else {
            format!("http://{}", self.url)
        }
    }
}

impl fmt::Debug for S3Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Adapter")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl", &self.ssl)
            .field("bucket", &self.bucket)
            .finish()
    }
}

/// Flat object storage keyed by string.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobStoreError>;

    /// # Errors
    ///
    /// Returns [`BlobStoreError::NotFound`] for an unknown key.
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError>;

    /// Idempotent.
    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;
}

/// Opens a [`BlobStore`] from the adapter settings of an enable request.
#[async_trait]
pub trait BlobStoreFactory: Send + Sync {
    async fn connect(&self, adapter: &S3Adapter) -> Result<Arc<dyn BlobStore>, BlobStoreError>;
}

/// In-process blob store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobStoreError> {
        self.objects.write().await.insert(key.to_owned(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound {
                key: key.to_owned(),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

/// Hands out one shared [`MemoryBlobStore`] regardless of adapter settings,
/// so objects survive a seal/unseal cycle within the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStoreFactory {
    store: MemoryBlobStore,
}

impl MemoryBlobStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> MemoryBlobStore {
        self.store.clone()
    }
}

#[async_trait]
impl BlobStoreFactory for MemoryBlobStoreFactory {
    async fn connect(&self, _adapter: &S3Adapter) -> Result<Arc<dyn BlobStore>, BlobStoreError> {
        Ok(Arc::new(self.store.clone()))
    }
}

#[cfg(feature = "s3")]
pub use self::s3::{S3BlobStore, S3BlobStoreFactory};

#[cfg(feature = "s3")]
mod s3 {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use aws_credential_types::Credentials;
    use aws_credential_types::provider::SharedCredentialsProvider;
    use aws_sdk_s3::config::Region;
    use aws_sdk_s3::primitives::ByteStream;
    use tracing::info;

    use super::{BlobStore, BlobStoreFactory, S3Adapter};
    use crate::error::BlobStoreError;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    fn request_error(key: &str, reason: impl ToString) -> BlobStoreError {
        BlobStoreError::Request {
            key: key.to_owned(),
            reason: reason.to_string(),
        }
    }

    async fn timed<F, T, E>(key: &str, fut: F) -> Result<Result<T, E>, BlobStoreError>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        tokio::time::timeout(REQUEST_TIMEOUT, fut)
            .await
            .map_err(|_| request_error(key, "timed out"))
    }

    /// Blob store on an S3-compatible service.
    #[derive(Debug, Clone)]
    pub struct S3BlobStore {
        client: aws_sdk_s3::Client,
        bucket: String,
    }

    #[async_trait]
    impl BlobStore for S3BlobStore {
        async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobStoreError> {
            let request = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(data))
                .content_type("application/octet-stream")
                .send();
            timed(key, request)
                .await?
                .map_err(|e| request_error(key, e.into_service_error()))?;
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
            let request = self.client.get_object().bucket(&self.bucket).key(key).send();
            let output = match timed(key, request).await? {
                Ok(output) => output,
                Err(e) => {
                    let service = e.into_service_error();
                    if service.is_no_such_key() {
                        return Err(BlobStoreError::NotFound {
                            key: key.to_owned(),
                        });
                    }
                    return Err(request_error(key, service));
                }
            };
            let bytes = output
                .body
                .collect()
                .await
                .map_err(|e| request_error(key, e))?
                .into_bytes();
            Ok(bytes.to_vec())
        }

        async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
            let request = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send();
            timed(key, request)
                .await?
                .map_err(|e| request_error(key, e.into_service_error()))?;
            Ok(())
        }
    }

    /// Builds [`S3BlobStore`]s, creating the bucket if it does not exist.
    #[derive(Debug, Clone)]
    pub struct S3BlobStoreFactory {
        region: String,
    }

    impl S3BlobStoreFactory {
        pub fn new(region: impl Into<String>) -> Self {
            Self {
                region: region.into(),
            }
        }
    }

    #[async_trait]
    impl BlobStoreFactory for S3BlobStoreFactory {
        async fn connect(&self, adapter: &S3Adapter) -> Result<Arc<dyn BlobStore>, BlobStoreError> {
            let creds = Credentials::new(&adapter.user, &adapter.password, None, None, "secman");
            let config = aws_sdk_s3::Config::builder()
                .region(Region::new(self.region.clone()))
                .credentials_provider(SharedCredentialsProvider::new(creds))
                .behavior_version_latest()
                .endpoint_url(adapter.endpoint())
                .force_path_style(true)
                .build();
            let client = aws_sdk_s3::Client::from_conf(config);

            let bucket = adapter.bucket.clone();
            let head = client.head_bucket().bucket(&bucket).send();
            if timed(&bucket, head).await?.is_err() {
                let create = client.create_bucket().bucket(&bucket).send();
                timed(&bucket, create)
                    .await?
                    .map_err(|e| BlobStoreError::Config {
                        reason: format!("cannot create bucket '{bucket}': {}", e.into_service_error()),
                    })?;
                info!(bucket = %bucket, "blob bucket created");
            }

            Ok(Arc::new(S3BlobStore { client, bucket }))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryBlobStore::new();
        store.put("a", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), b"hello");
        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(matches!(
            store.get("a").await,
            Err(BlobStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn memory_factory_shares_objects() {
        let factory = MemoryBlobStoreFactory::new();
        let first = factory.connect(&S3Adapter::default()).await.unwrap();
        first.put("k", vec![1]).await.unwrap();
        let second = factory.connect(&S3Adapter::default()).await.unwrap();
        assert_eq!(second.get("k").await.unwrap(), vec![1]);
    }

    #[test]
    fn endpoint_adds_scheme() {
        let mut adapter = S3Adapter {
            url: "minio:9000".to_owned(),
            ..S3Adapter::default()
        };
        assert_eq!(adapter.endpoint(), "http://minio:9000");
        adapter.ssl = true;
        assert_eq!(adapter.endpoint(), "https://minio:9000");
        adapter.url = "http://localhost:9000".to_owned();
        assert_eq!(adapter.endpoint(), "http://localhost:9000");
    }

    #[test]
    fn debug_hides_password() {
        let adapter = S3Adapter {
            password: "hunter2".to_owned(),
            ..S3Adapter::default()
        };
        assert!(!format!("{adapter:?}").contains("hunter2"));
    }
}
