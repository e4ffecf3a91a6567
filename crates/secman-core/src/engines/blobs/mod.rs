//! Blob secrets.
//!
//! Object bytes live in an external [`BlobStore`]. The engine keeps, on the
//! barrier, a record `data/<token>` holding the object key and a metadata
//! record `metadata/<token>`. Clients only ever see the random token.

mod store;

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

pub use self::store::{
    BlobStore, BlobStoreFactory, DEFAULT_BUCKET, MemoryBlobStore, MemoryBlobStoreFactory,
    S3Adapter,
};
#[cfg(feature = "s3")]
pub use self::store::{S3BlobStore, S3BlobStoreFactory};

use crate::backend::{
    Backend, EngineState, LogicalParams, LogicalRequest, LogicalResponse, Method,
    ParamsRepository, Path, Paths, handler,
};
use crate::backend_router::BackendRouter;
use crate::barrier::BarrierStorage;
use crate::engines::{Metadata, MetadataBody, MetadataRepository, random_token, timestamp};
use crate::error::{BlobStoreError, EngineError};
use crate::logical_storage::LogicalStorage;

pub const ROOT_PATH: &str = "secrets/blobs";

/// Persisted engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobParams {
    pub adapter: S3Adapter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateBlobBody {
    /// Base64 encoded content.
    pub data: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Loaded params and the store they opened.
struct Runtime {
    store: Arc<dyn BlobStore>,
}

/// `attachment` disposition with `name` as a quoted string. Control
/// characters are dropped, quotes and backslashes escaped.
fn attachment(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len());
    for c in name.chars().filter(|c| !c.is_control()) {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    format!("attachment; filename=\"{quoted}\"")
}

/// The `secrets/blobs` engine.
#[derive(Clone)]
pub struct BlobsBackend {
    state: Arc<EngineState<Runtime>>,
    params: ParamsRepository,
    records: LogicalStorage,
    metadata: MetadataRepository,
    factory: Arc<dyn BlobStoreFactory>,
}

fn validate(params: &mut BlobParams) -> Result<(), String> {
    let adapter = &mut params.adapter;
    for (name, value) in [
        ("url", &adapter.url),
        ("user", &adapter.user),
        ("password", &adapter.password),
    ] {
        if value.is_empty() {
            return Err(format!("invalid request, missing required field: {name}"));
        }
    }
    if adapter.bucket.is_empty() {
        adapter.bucket = DEFAULT_BUCKET.to_owned();
    }
    Ok(())
}

impl BlobsBackend {
    pub fn new(storage: LogicalStorage, factory: Arc<dyn BlobStoreFactory>) -> Self {
        Self {
            state: Arc::new(EngineState::new(ROOT_PATH)),
            params: ParamsRepository::new(&storage),
            records: storage.scoped("data"),
            metadata: MetadataRepository::new(&storage),
            factory,
        }
    }

    async fn object_key(&self, token: &str) -> Result<Option<String>, EngineError> {
        Ok(self.records.get_ok(token).await?.map(|entry| entry.value))
    }

    async fn create(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let runtime = self.state.read().await?;
        let body: CreateBlobBody = p.bind()?;
        let Ok(data) = BASE64.decode(body.data.as_bytes()) else {
            return Ok(LogicalResponse::bad_request("data must be base64 encoded"));
        };

        let token = random_token();
        let key = Uuid::new_v4().to_string();
        let size = data.len();
        runtime.store.put(&key, data).await?;

        if let Err(e) = self.records.update(&token, &key, None).await {
            if let Err(cleanup) = runtime.store.delete(&key).await {
                warn!(error = %cleanup, "blobs: orphaned object left behind");
            }
            return Err(e.into());
        }

        let mut metadata = body.metadata;
        metadata.insert("created_at".to_owned(), timestamp());
        metadata.insert("size".to_owned(), size.to_string());
        if let Err(e) = self.metadata.put(&token, &metadata).await {
            if let Err(cleanup) = self.records.delete(&token).await {
                warn!(error = %cleanup, "blobs: orphaned record left behind");
            }
            if let Err(cleanup) = runtime.store.delete(&key).await {
                warn!(error = %cleanup, "blobs: orphaned object left behind");
            }
            return Err(e);
        }

        Ok(LogicalResponse::ok(json!({ "token": token })))
    }

    async fn show(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let runtime = self.state.read().await?;
        let token = p.param("token")?;
        let Some(key) = self.object_key(token).await? else {
            return Ok(LogicalResponse::not_found("blob not found"));
        };
        let data = match runtime.store.get(&key).await {
            Ok(data) => data,
            Err(BlobStoreError::NotFound { .. }) => {
                return Ok(LogicalResponse::not_found("blob not found"));
            }
            Err(e) => return Err(e.into()),
        };

        let mut response = LogicalResponse::bytes(data);
        if let Some(name) = self
            .metadata
            .get(token)
            .await?
            .and_then(|metadata| metadata.get("file_name").cloned())
        {
            response = response.with_header("content-disposition", &attachment(&name));
        }
        Ok(response)
    }

    async fn show_metadata(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _runtime = self.state.read().await?;
        match self.metadata.get(p.param("token")?).await? {
            Some(metadata) => Ok(LogicalResponse::ok(json!({ "value": metadata }))),
            None => Ok(LogicalResponse::not_found("metadata not found")),
        }
    }

    async fn update_metadata(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _runtime = self.state.read().await?;
        let body: MetadataBody = p.bind()?;
        match self.metadata.merge(p.param("token")?, body.metadata).await? {
            Some(metadata) => Ok(LogicalResponse::ok(json!({ "value": metadata }))),
            None => Ok(LogicalResponse::not_found("metadata not found")),
        }
    }

    async fn delete(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let runtime = self.state.read().await?;
        let token = p.param("token")?;
        let Some(key) = self.object_key(token).await? else {
            return Ok(LogicalResponse::not_found("blob not found"));
        };
        self.records.delete(token).await?;
        self.metadata.delete(token).await?;
        runtime.store.delete(&key).await?;
        Ok(LogicalResponse::no_content())
    }
}

#[async_trait]
impl Backend for BlobsBackend {
    fn root_path(&self) -> &'static str {
        ROOT_PATH
    }

    fn help(&self) -> &'static str {
        "Blobs backend, stores binary data in S3-compatible storage"
    }

    fn paths(&self) -> Paths {
        Paths::new()
            .route(
                Method::Post,
                "/secrets/blobs",
                Path::new(handler(self, Self::create), "Create a blob").body::<CreateBlobBody>(),
            )
            .route(
                Method::Get,
                "/secrets/blobs/:token",
                Path::new(handler(self, Self::show), "Get a blob")
                    .field("token", "The token of the blob"),
            )
            .route(
                Method::Get,
                "/secrets/blobs/:token/metadata",
                Path::new(handler(self, Self::show_metadata), "Get the metadata of a blob")
                    .field("token", "The token of the blob"),
            )
            .route(
                Method::Put,
                "/secrets/blobs/:token/metadata",
                Path::new(handler(self, Self::update_metadata), "Update the metadata of a blob")
                    .field("token", "The token of the blob")
                    .body::<MetadataBody>(),
            )
            .route(
                Method::Delete,
                "/secrets/blobs/:token",
                Path::new(handler(self, Self::delete), "Delete a blob")
                    .field("token", "The token of the blob"),
            )
    }

    async fn enable(&self, req: &LogicalRequest) -> Result<LogicalResponse, EngineError> {
        let mut guard = self.state.write().await;
        if self.state.is_enabled() {
            return Ok(LogicalResponse::not_modified());
        }

        let Some(mut params) = req
            .body
            .clone()
            .and_then(|body| serde_json::from_value::<BlobParams>(body).ok())
        else {
            return Ok(LogicalResponse::message(400, "body is invalid or empty"));
        };
        if let Err(message) = validate(&mut params) {
            return Ok(LogicalResponse::message(400, message));
        }

        let store = self.factory.connect(&params.adapter).await?;
        self.params.put(&params).await?;
        *guard = Some(Runtime { store });
        self.state.set_enabled();
        info!(engine = ROOT_PATH, bucket = %params.adapter.bucket, "blobs enabled");
        Ok(LogicalResponse::message(200, "blobs enabled"))
    }

    async fn post_unseal(&self) -> Result<(), EngineError> {
        let mut guard = self.state.write().await;
        let params: BlobParams = self
            .params
            .get()
            .await?
            .ok_or_else(|| self.state.not_enabled())?;
        let store = self.factory.connect(&params.adapter).await?;
        *guard = Some(Runtime { store });
        self.state.set_enabled();
        Ok(())
    }

    async fn router(&self) -> Option<Arc<BackendRouter>> {
        self.state.router().await
    }

    async fn set_router(&self, router: Arc<BackendRouter>) {
        self.state.set_router(router).await;
    }

    async fn unload(&self) {
        self.state.unload().await;
    }
}
