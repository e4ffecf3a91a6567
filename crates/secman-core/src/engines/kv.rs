//! Key/value secrets.
//!
//! Values live at `secrets/kv/data/<key>` and metadata at
//! `secrets/kv/metadata/<key>`. Keys may contain slashes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::backend::{
    Backend, EngineState, LogicalParams, LogicalRequest, LogicalResponse, Method,
    ParamsRepository, Path, Paths, handler,
};
use crate::backend_router::BackendRouter;
use crate::barrier::BarrierStorage;
use crate::engines::{Metadata, MetadataBody, MetadataRepository, timestamp};
use crate::error::EngineError;
use crate::logical_storage::LogicalStorage;

pub const ROOT_PATH: &str = "secrets/kv";

/// Last segment reserved for the metadata routes.
const METADATA_SEGMENT: &str = "metadata";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvParams {
    pub enabled_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSecretBody {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSecretBody {
    pub value: String,
}

/// The `secrets/kv` engine.
#[derive(Clone)]
pub struct KvBackend {
    state: Arc<EngineState<KvParams>>,
    params: ParamsRepository,
    data: LogicalStorage,
    metadata: MetadataRepository,
}

impl KvBackend {
    pub fn new(storage: LogicalStorage) -> Self {
        Self {
            state: Arc::new(EngineState::new(ROOT_PATH)),
            params: ParamsRepository::new(&storage),
            data: storage.scoped("data"),
            metadata: MetadataRepository::new(&storage),
        }
    }

    async fn index(self, _req: LogicalRequest, _p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let entries: Vec<String> = self
            .data
            .list("/")
            .await?
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        Ok(LogicalResponse::ok(json!({ "entries": entries })))
    }

    async fn show(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let key = p.param("key")?;
        match self.data.get_ok(key).await? {
            Some(entry) => Ok(LogicalResponse::ok(json!({ "value": entry.value }))),
            None => Ok(LogicalResponse::json(
                404,
                json!({ "error": "key not found", "key": key }),
            )),
        }
    }

    async fn show_metadata(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let key = p.param("key")?;
        match self.metadata.get(key).await? {
            Some(metadata) => Ok(LogicalResponse::ok(json!({ "value": metadata }))),
            None => Ok(LogicalResponse::json(
                404,
                json!({ "error": "metadata not found", "key": key }),
            )),
        }
    }

    async fn create(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let body: CreateSecretBody = p.bind()?;
        if body.key.is_empty() {
            return Ok(LogicalResponse::bad_request("key is required"));
        }
        if body.key.rsplit('/').next() == Some(METADATA_SEGMENT) {
            return Ok(LogicalResponse::bad_request("key must not end with /metadata"));
        }
        if self.data.get_ok(&body.key).await?.is_some() {
            return Ok(LogicalResponse::error(409, "key already exists"));
        }

        self.data.update(&body.key, &body.value, None).await?;
        let mut metadata = Metadata::new();
        metadata.insert("created_at".to_owned(), timestamp());
        if let Err(e) = self.metadata.put(&body.key, &metadata).await {
            self.data.delete(&body.key).await?;
            return Err(e);
        }
        Ok(LogicalResponse::ok(json!({})))
    }

    async fn update(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let key = p.param("key")?;
        let body: UpdateSecretBody = p.bind()?;
        if self.data.get_ok(key).await?.is_none() {
            return Ok(LogicalResponse::json(
                404,
                json!({ "error": "key not found", "key": key }),
            ));
        }

        self.data.update(key, &body.value, None).await?;
        let mut stamp = Metadata::new();
        stamp.insert("updated_at".to_owned(), timestamp());
        if self.metadata.merge(key, stamp.clone()).await?.is_none() {
            self.metadata.put(key, &stamp).await?;
        }
        Ok(LogicalResponse::ok(json!({})))
    }

    async fn update_metadata(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let key = p.param("key")?;
        let body: MetadataBody = p.bind()?;
        match self.metadata.merge(key, body.metadata).await? {
            Some(metadata) => Ok(LogicalResponse::ok(json!({ "value": metadata }))),
            None => Ok(LogicalResponse::json(
                404,
                json!({ "error": "metadata not found", "key": key }),
            )),
        }
    }

    async fn delete(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let key = p.param("key")?;
        self.data.delete(key).await?;
        self.metadata.delete(key).await?;
        Ok(LogicalResponse::ok(json!({})))
    }
}

#[async_trait]
impl Backend for KvBackend {
    fn root_path(&self) -> &'static str {
        ROOT_PATH
    }

    fn help(&self) -> &'static str {
        "KV backend, uses key-value pairs to store data"
    }

    fn paths(&self) -> Paths {
        Paths::new()
            .route(
                Method::Get,
                "/secrets/kv",
                Path::new(handler(self, Self::index), "List keys"),
            )
            .route(
                Method::Get,
                "/secrets/kv/:key",
                Path::new(handler(self, Self::show), "Get a key-value pair")
                    .field("key", "The key to get"),
            )
            .route(
                Method::Get,
                "/secrets/kv/:key/metadata",
                Path::new(handler(self, Self::show_metadata), "Get the metadata of a key-value pair")
                    .field("key", "The key to get the metadata of"),
            )
            .route(
                Method::Post,
                "/secrets/kv",
                Path::new(handler(self, Self::create), "Create a key-value pair")
                    .body::<CreateSecretBody>(),
            )
            .route(
                Method::Put,
                "/secrets/kv/:key",
                Path::new(handler(self, Self::update), "Replace the value of a key")
                    .field("key", "The key to update")
                    .body::<UpdateSecretBody>(),
            )
            .route(
                Method::Put,
                "/secrets/kv/:key/metadata",
                Path::new(handler(self, Self::update_metadata), "Merge metadata into a key")
                    .field("key", "The key to update")
                    .body::<MetadataBody>(),
            )
            .route(
                Method::Delete,
                "/secrets/kv/:key",
                Path::new(handler(self, Self::delete), "Delete a key-value pair")
                    .field("key", "The key to delete"),
            )
    }

    async fn enable(&self, _req: &LogicalRequest) -> Result<LogicalResponse, EngineError> {
        let mut guard = self.state.write().await;
        if self.state.is_enabled() {
            return Ok(LogicalResponse::not_modified());
        }
        let params = KvParams {
            enabled_at: timestamp(),
        };
        self.params.put(&params).await?;
        *guard = Some(params);
        self.state.set_enabled();
        info!(engine = ROOT_PATH, "kv enabled");
        Ok(LogicalResponse::message(200, "kv enabled"))
    }

    async fn post_unseal(&self) -> Result<(), EngineError> {
        let mut guard = self.state.write().await;
        let params: KvParams = self
            .params
            .get()
            .await?
            .ok_or_else(|| self.state.not_enabled())?;
        *guard = Some(params);
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engines::tests::{call, engine_storage};

    async fn enabled() -> KvBackend {
        let kv = KvBackend::new(engine_storage(ROOT_PATH));
        let req = LogicalRequest::new(Method::Post, "/sys/engines/enable/secrets/kv");
        assert_eq!(kv.enable(&req).await.unwrap().status, 200);
        kv
    }

    #[tokio::test]
    async fn enable_is_idempotent_and_restorable() {
        let storage = engine_storage(ROOT_PATH);
        let kv = KvBackend::new(storage.clone());
        let req = LogicalRequest::new(Method::Post, "/sys/engines/enable/secrets/kv");
        assert_eq!(kv.enable(&req).await.unwrap().status, 200);
        assert_eq!(kv.enable(&req).await.unwrap().status, 304);

        let restored = KvBackend::new(storage);
        restored.post_unseal().await.unwrap();
        assert!(restored.state.is_enabled());
    }

    #[tokio::test]
    async fn post_unseal_without_params_fails() {
        let kv = KvBackend::new(engine_storage(ROOT_PATH));
        assert!(matches!(
            kv.post_unseal().await,
            Err(EngineError::NotEnabled { .. })
        ));
    }

    #[tokio::test]
    async fn handlers_require_enable() {
        let kv = KvBackend::new(engine_storage(ROOT_PATH));
        let router = BackendRouter::new(&kv.paths()).unwrap();
        let res = router
            .handle(LogicalRequest::new(Method::Get, "/secrets/kv"))
            .await;
        assert!(matches!(res, Err(EngineError::NotEnabled { .. })));
    }

    #[tokio::test]
    async fn create_show_list_delete() {
        let kv = enabled().await;
        let res = call(&kv, Method::Post, "/secrets/kv", Some(json!({"key": "db/password", "value": "s3cret"}))).await;
        assert_eq!(res.status, 200);

        let res = call(&kv, Method::Get, "/secrets/kv/db/password", None).await;
        assert_eq!(res.json_body().unwrap()["value"], "s3cret");

        let res = call(&kv, Method::Get, "/secrets/kv/db/password/metadata", None).await;
        assert!(res.json_body().unwrap()["value"]["created_at"].is_string());

        let res = call(&kv, Method::Get, "/secrets/kv", None).await;
        assert_eq!(res.json_body().unwrap()["entries"], json!(["db/password"]));

        let res = call(&kv, Method::Delete, "/secrets/kv/db/password", None).await;
        assert_eq!(res.status, 200);
        let res = call(&kv, Method::Get, "/secrets/kv/db/password", None).await;
        assert_eq!(res.status, 404);
        let res = call(&kv, Method::Get, "/secrets/kv/db/password/metadata", None).await;
        assert_eq!(res.status, 404);
    }

    #[tokio::test]
    async fn create_existing_key_conflicts() {
        let kv = enabled().await;
        let body = json!({"key": "k", "value": "v"});
        call(&kv, Method::Post, "/secrets/kv", Some(body.clone())).await;
        let res = call(&kv, Method::Post, "/secrets/kv", Some(body)).await;
        assert_eq!(res.status, 409);
    }

    #[tokio::test]
    async fn metadata_suffix_is_reserved() {
        let kv = enabled().await;
        for key in ["metadata", "db/metadata"] {
            let res = call(&kv, Method::Post, "/secrets/kv", Some(json!({"key": key, "value": "v"}))).await;
            assert_eq!(res, LogicalResponse::bad_request("key must not end with /metadata"), "{key}");
        }
        let res = call(&kv, Method::Post, "/secrets/kv", Some(json!({"key": "metadata/db", "value": "v"}))).await;
        assert_eq!(res.status, 200);
    }

    #[tokio::test]
    async fn create_with_bad_body_echoes_schema() {
        let kv = enabled().await;
        let res = call(&kv, Method::Post, "/secrets/kv", Some(json!({"key": "k"}))).await;
        assert_eq!(res.status, 400);
        assert_eq!(res.json_body().unwrap()["schema"], json!({"key": "", "value": ""}));
    }

    #[tokio::test]
    async fn update_replaces_value_and_stamps_metadata() {
        let kv = enabled().await;
        let res = call(&kv, Method::Put, "/secrets/kv/k", Some(json!({"value": "v2"}))).await;
        assert_eq!(res.status, 404);

        call(&kv, Method::Post, "/secrets/kv", Some(json!({"key": "k", "value": "v1"}))).await;
        let res = call(&kv, Method::Put, "/secrets/kv/k", Some(json!({"value": "v2"}))).await;
        assert_eq!(res.status, 200);

        let res = call(&kv, Method::Get, "/secrets/kv/k", None).await;
        assert_eq!(res.json_body().unwrap()["value"], "v2");
        let res = call(&kv, Method::Get, "/secrets/kv/k/metadata", None).await;
        let metadata = &res.json_body().unwrap()["value"];
        assert!(metadata["created_at"].is_string());
        assert!(metadata["updated_at"].is_string());
    }

    #[tokio::test]
    async fn update_metadata_merges() {
        let kv = enabled().await;
        let res = call(&kv, Method::Put, "/secrets/kv/k/metadata", Some(json!({"metadata": {"a": "1"}}))).await;
        assert_eq!(res.status, 404);

        call(&kv, Method::Post, "/secrets/kv", Some(json!({"key": "k", "value": "v"}))).await;
        let res = call(&kv, Method::Put, "/secrets/kv/k/metadata", Some(json!({"metadata": {"owner": "ops"}}))).await;
        assert_eq!(res.status, 200);
        let merged = &res.json_body().unwrap()["value"];
        assert_eq!(merged["owner"], "ops");
        assert!(merged["created_at"].is_string());
    }
}
