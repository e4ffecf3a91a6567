//! PCI-DSS card tokenization.
//!
//! A card is stored as four records under `secrets/pci_dss/data`:
//!
//! - `<pan_token>`: the PAN, where `pan_token = hex(sha256(pan))`
//! - `<pan_token>/cardholder_name/<token>`
//! - `<pan_token>/expiry_date/<token>`: stored as `MM/YY`
//! - `<pan_token>/security_code/<token>`
//!
//! The PAN token is deterministic so a card can only be stored once. The
//! three field tokens are random and independent of each other and of the
//! PAN. Creation is not atomic: every record written is pushed on a rollback
//! stack, and any failure deletes them again in reverse order, the PAN last.
//! Creates are serialized so a rollback never removes another create's PAN.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::{
    Backend, EngineState, LogicalParams, LogicalRequest, LogicalResponse, Method,
    ParamsRepository, Path, Paths, handler,
};
use crate::backend_router::BackendRouter;
use crate::barrier::BarrierStorage;
use crate::engines::{Metadata, MetadataBody, MetadataRepository, random_token, timestamp};
use crate::error::EngineError;
use crate::logical_storage::LogicalStorage;

pub const ROOT_PATH: &str = "secrets/pci_dss";

const CARDHOLDER_NAME: &str = "cardholder_name";
const EXPIRY_DATE: &str = "expiry_date";
const SECURITY_CODE: &str = "security_code";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PciDssParams {
    pub enabled_at: String,
}

/// Raw card fields. Missing fields deserialize as empty and are reported by
/// the create handler one at a time.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CardData {
    pub pan: String,
    pub cardholder_name: String,
    /// RFC 3339 timestamp; only month and year are kept.
    pub expiry_date: String,
    pub security_code: String,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CreateCardBody {
    pub card_data: CardData,
}

/// Tokens returned by a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardTokens {
    pub pan: String,
    pub cardholder_name: String,
    pub expiry_date: String,
    pub security_code: String,
}

/// A record written during create, undone on failure.
enum Written {
    Data(String),
    Metadata(String),
}

fn pan_token(pan: &str) -> String {
    hex::encode(Sha256::digest(pan.as_bytes()))
}

/// Check the card fields in declaration order and normalize the expiry date.
fn validate(card: &CardData) -> Result<String, EngineError> {
    if card.pan.is_empty() {
        return Err(EngineError::logical("PAN is required"));
    }
    if card.cardholder_name.is_empty() {
        return Err(EngineError::logical("cardholder name is required"));
    }
    if card.expiry_date.is_empty() {
        return Err(EngineError::logical("expiry date is required"));
    }
    let expiry = DateTime::parse_from_rfc3339(&card.expiry_date).map_err(|_| {
        EngineError::logical("invalid expiry date format, expected RFC3339Nano")
    })?;
    if card.security_code.is_empty() {
        return Err(EngineError::logical("security code is required"));
    }
    Ok(expiry.format("%m/%y").to_string())
}

/// The `secrets/pci_dss` engine.
#[derive(Clone)]
pub struct PciDssBackend {
    state: Arc<EngineState<PciDssParams>>,
    params: ParamsRepository,
    data: LogicalStorage,
    metadata: MetadataRepository,
    creating: Arc<Mutex<()>>,
}

impl PciDssBackend {
    pub fn new(storage: LogicalStorage) -> Self {
        Self {
            state: Arc::new(EngineState::new(ROOT_PATH)),
            params: ParamsRepository::new(&storage),
            data: storage.scoped("data"),
            metadata: MetadataRepository::new(&storage),
            creating: Arc::new(Mutex::new(())),
        }
    }

    async fn write(&self, written: &mut Vec<Written>, key: String, value: &str) -> Result<(), EngineError> {
        self.data.update(&key, value, None).await?;
        written.push(Written::Data(key));
        Ok(())
    }

    async fn store_card(
        &self,
        card: &CardData,
        expiry: &str,
        written: &mut Vec<Written>,
    ) -> Result<CardTokens, EngineError> {
        let pan = pan_token(&card.pan);
        if self.data.get_ok(&pan).await?.is_some() {
            return Err(EngineError::logical("such PAN already exists"));
        }
        self.write(written, pan.clone(), &card.pan).await?;

        let mut metadata = Metadata::new();
        metadata.insert("created_at".to_owned(), timestamp());
        self.metadata.put(&pan, &metadata).await?;
        written.push(Written::Metadata(pan.clone()));

        let cardholder_name = random_token();
        self.write(
            written,
            format!("{pan}/{CARDHOLDER_NAME}/{cardholder_name}"),
            &card.cardholder_name,
        )
        .await?;

        let expiry_date = random_token();
        self.write(written, format!("{pan}/{EXPIRY_DATE}/{expiry_date}"), expiry)
            .await?;

        let security_code = random_token();
        self.write(
            written,
            format!("{pan}/{SECURITY_CODE}/{security_code}"),
            &card.security_code,
        )
        .await?;

        Ok(CardTokens {
            pan,
            cardholder_name,
            expiry_date,
            security_code,
        })
    }

    async fn rollback(&self, written: Vec<Written>) {
        for record in written.into_iter().rev() {
            let result = match &record {
                Written::Data(key) => self.data.delete(key).await.map_err(EngineError::from),
                Written::Metadata(key) => self.metadata.delete(key).await,
            };
            if let Err(e) = result {
                warn!(error = %e, "pci_dss: rollback step failed");
            }
        }
    }

    async fn create(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let body: CreateCardBody = p.bind()?;
        let card = body.card_data;

        let expiry = match validate(&card) {
            Ok(expiry) => expiry,
            Err(EngineError::LogicalResponse { message }) => {
                return Ok(LogicalResponse::bad_request(message));
            }
            Err(e) => return Err(e),
        };

        let _creating = self.creating.lock().await;
        let mut written = Vec::with_capacity(5);
        match self.store_card(&card, &expiry, &mut written).await {
            Ok(tokens) => Ok(LogicalResponse::ok(json!(tokens))),
            Err(e) => {
                self.rollback(written).await;
                match e {
                    EngineError::LogicalResponse { message } => Ok(LogicalResponse::bad_request(message)),
                    other => Err(other),
                }
            }
        }
    }

    async fn index(self, _req: LogicalRequest, _p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let tokens: Vec<String> = self
            .data
            .list("/")
            .await?
            .into_iter()
            .map(|entry| entry.key)
            .filter(|key| !key.contains('/'))
            .collect();
        Ok(LogicalResponse::ok(json!({ "entries": tokens })))
    }

    async fn show_value(&self, key: &str, missing: &str) -> Result<LogicalResponse, EngineError> {
        match self.data.get_ok(key).await? {
            Some(entry) => Ok(LogicalResponse::ok(json!({ "value": entry.value }))),
            None => Ok(LogicalResponse::not_found(missing)),
        }
    }

    async fn show_pan(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        self.show_value(p.param("pan_token")?, "pan not found").await
    }

    async fn show_cardholder_name(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let key = format!(
            "{}/{CARDHOLDER_NAME}/{}",
            p.param("pan_token")?,
            p.param("cardholder_name_token")?
        );
        self.show_value(&key, "cardholder name not found").await
    }

    async fn show_expiry_date(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let key = format!(
            "{}/{EXPIRY_DATE}/{}",
            p.param("pan_token")?,
            p.param("expiry_date_token")?
        );
        self.show_value(&key, "expiry date not found").await
    }

    async fn show_security_code(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let key = format!(
            "{}/{SECURITY_CODE}/{}",
            p.param("pan_token")?,
            p.param("security_code_token")?
        );
        self.show_value(&key, "security code not found").await
    }

    async fn show_metadata(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        match self.metadata.get(p.param("pan_token")?).await? {
            Some(metadata) => Ok(LogicalResponse::ok(json!({ "value": metadata }))),
            None => Ok(LogicalResponse::not_found("metadata not found")),
        }
    }

    async fn update_metadata(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let body: MetadataBody = p.bind()?;
        match self.metadata.merge(p.param("pan_token")?, body.metadata).await? {
            Some(metadata) => Ok(LogicalResponse::ok(json!({ "value": metadata }))),
            None => Ok(LogicalResponse::not_found("metadata not found")),
        }
    }

    async fn delete(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let pan = p.param("pan_token")?;
        if self.data.get_ok(pan).await?.is_none() {
            return Ok(LogicalResponse::not_found("pan not found"));
        }

        for entry in self.data.list(&format!("{pan}/")).await? {
            self.data.delete(&entry.key).await?;
        }
        self.data.delete(pan).await?;
        self.metadata.delete(pan).await?;
        info!(engine = ROOT_PATH, "card deleted");
        Ok(LogicalResponse::no_content())
    }
}

#[async_trait]
impl Backend for PciDssBackend {
    fn root_path(&self) -> &'static str {
        ROOT_PATH
    }

    fn help(&self) -> &'static str {
        "PCI-DSS backend, tokenizes card data field by field"
    }

    fn paths(&self) -> Paths {
        Paths::new()
            .route(
                Method::Get,
                "/secrets/pci_dss",
                Path::new(handler(self, Self::index), "List PAN tokens"),
            )
            .route(
                Method::Get,
                "/secrets/pci_dss/:pan_token",
                Path::new(handler(self, Self::show_pan), "Get the PAN")
                    .field("pan_token", "PAN token"),
            )
            .route(
                Method::Get,
                "/secrets/pci_dss/:pan_token/metadata",
                Path::new(handler(self, Self::show_metadata), "Get card metadata")
                    .field("pan_token", "PAN token"),
            )
            .route(
                Method::Get,
                "/secrets/pci_dss/:pan_token/cardholder_name/:cardholder_name_token",
                Path::new(handler(self, Self::show_cardholder_name), "Get the cardholder name")
                    .field("pan_token", "PAN token")
                    .field("cardholder_name_token", "Cardholder name token"),
            )
            .route(
                Method::Get,
                "/secrets/pci_dss/:pan_token/expiry_date/:expiry_date_token",
                Path::new(handler(self, Self::show_expiry_date), "Get the expiry date")
                    .field("pan_token", "PAN token")
                    .field("expiry_date_token", "Expiry date token"),
            )
            .route(
                Method::Get,
                "/secrets/pci_dss/:pan_token/security_code/:security_code_token",
                Path::new(handler(self, Self::show_security_code), "Get the security code")
                    .field("pan_token", "PAN token")
                    .field("security_code_token", "Security code token"),
            )
            .route(
                Method::Post,
                "/secrets/pci_dss",
                Path::new(handler(self, Self::create), "Tokenize a card")
                    .body::<CreateCardBody>(),
            )
            .route(
                Method::Put,
                "/secrets/pci_dss/:pan_token/metadata",
                Path::new(handler(self, Self::update_metadata), "Merge card metadata")
                    .field("pan_token", "PAN token")
                    .body::<MetadataBody>(),
            )
            .route(
                Method::Delete,
                "/secrets/pci_dss/:pan_token",
                Path::new(handler(self, Self::delete), "Delete a card and all its tokens")
                    .field("pan_token", "PAN token"),
            )
    }

    async fn enable(&self, _req: &LogicalRequest) -> Result<LogicalResponse, EngineError> {
        let mut guard = self.state.write().await;
        if self.state.is_enabled() {
            return Ok(LogicalResponse::not_modified());
        }
        let params = PciDssParams {
            enabled_at: timestamp(),
        };
        self.params.put(&params).await?;
        *guard = Some(params);
        self.state.set_enabled();
        info!(engine = ROOT_PATH, "pci_dss enabled");
        Ok(LogicalResponse::message(200, "pci_dss enabled"))
    }

    async fn post_unseal(&self) -> Result<(), EngineError> {
        let mut guard = self.state.write().await;
        let params: PciDssParams = self
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
