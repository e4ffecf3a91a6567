//! The engine contract.
//!
//! A [`Backend`] is a pluggable secret or auth engine mounted at a root path.
//! It declares its routes through [`Backend::paths`], persists configuration
//! on [`Backend::enable`], and restores it in [`Backend::post_unseal`] after
//! every unseal. [`EngineState`] holds the pieces every engine shares: the
//! `exist` flag, the params lock and the installed router.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend_router::BackendRouter;
use crate::barrier::BarrierStorage;
use crate::error::EngineError;
use crate::logical_storage::LogicalStorage;

/// HTTP methods an engine can route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Upper-case method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unsupported method '{other}'")),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request as seen by an engine.
#[derive(Debug, Clone)]
pub struct LogicalRequest {
    pub method: Method,
    /// Engine path with a leading slash, e.g. `/secrets/kv/db_password`.
    pub path: String,
    /// Request headers with lower-cased names.
    pub headers: HashMap<String, String>,
    /// Parsed JSON body, if one was sent.
    pub body: Option<Value>,
}

impl LogicalRequest {
    /// Build a request for `path`, adding the leading slash if missing.
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: format!("/{}", path.trim_start_matches('/')),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Attach a JSON body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Attach a header. The name is lower-cased.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_owned());
        self
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Path captures and the validated body handed to a handler.
#[derive(Debug, Clone, Default)]
pub struct LogicalParams {
    pub params: HashMap<String, String>,
    pub body: Option<Value>,
}

impl LogicalParams {
    /// A captured path parameter.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TypeCast`] if the route declared no such capture.
    pub fn param(&self, name: &str) -> Result<&str, EngineError> {
        self.params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| EngineError::TypeCast {
                expected: format!("path parameter '{name}'"),
                reason: "not captured by route".to_owned(),
            })
    }

    /// Deserialize the body into the type the route declared.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TypeCast`] if there is no body or it does not
    /// match `T`. The router validates bodies first, so this indicates a
    /// mismatch between a route's schema and its handler.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        let body = self.body.clone().ok_or_else(|| EngineError::TypeCast {
            expected: std::any::type_name::<T>().to_owned(),
            reason: "request has no body".to_owned(),
        })?;
        serde_json::from_value(body).map_err(|e| EngineError::TypeCast {
            expected: std::any::type_name::<T>().to_owned(),
            reason: e.to_string(),
        })
    }
}

/// Response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Json(Value),
    Bytes(Vec<u8>),
}

/// A response produced by an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalResponse {
    pub status: u16,
    pub body: ResponseBody,
    pub headers: Vec<(String, String)>,
}

impl LogicalResponse {
    /// A response with a JSON body.
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: ResponseBody::Json(body),
            headers: Vec::new(),
        }
    }

    /// `200` with a JSON body.
    pub fn ok(body: Value) -> Self {
        Self::json(200, body)
    }

    /// `{"message": ...}` with the given status.
    pub fn message(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, json!({ "message": message.into() }))
    }

    /// `{"error": ...}` with the given status.
    pub fn error(status: u16, error: impl Into<String>) -> Self {
        Self::json(status, json!({ "error": error.into() }))
    }

    /// `400` with an error message.
    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::error(400, error)
    }

    /// `404` with an error message.
    pub fn not_found(error: impl Into<String>) -> Self {
        Self::error(404, error)
    }

    /// `304` without a body.
    pub fn not_modified() -> Self {
        Self::empty(304)
    }

    /// `204` without a body.
    pub fn no_content() -> Self {
        Self::empty(204)
    }

    /// A response without a body.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: ResponseBody::Empty,
            headers: Vec::new(),
        }
    }

    /// `200` with raw bytes served as `application/octet-stream`.
    pub fn bytes(data: Vec<u8>) -> Self {
        Self {
            status: 200,
            body: ResponseBody::Bytes(data),
            headers: vec![(
                "content-type".to_owned(),
                "application/octet-stream".to_owned(),
            )],
        }
    }

    /// Add a response header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The JSON body, if any.
    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Boxed future returned by a [`Handler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<LogicalResponse, EngineError>> + Send>>;

/// A route handler.
pub type Handler = Arc<dyn Fn(LogicalRequest, LogicalParams) -> HandlerFuture + Send + Sync>;

/// Wrap an engine method as a [`Handler`].
///
/// The engine is cloned into every call, so `f` can take it by value:
/// `handler(self, Self::show)`.
pub fn handler<B, F, Fut>(backend: &B, f: F) -> Handler
where
    B: Clone + Send + Sync + 'static,
    F: Fn(B, LogicalRequest, LogicalParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<LogicalResponse, EngineError>> + Send + 'static,
{
    let backend = backend.clone();
    Arc::new(move |req, params| Box::pin(f(backend.clone(), req, params)))
}

/// Documentation for a path parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub description: &'static str,
}

/// The body type a route accepts.
///
/// Holds a validator used by the router before dispatch and an example value
/// echoed back to clients that send a body of the wrong shape.
#[derive(Clone, Copy)]
pub struct BodySchema {
    validate: fn(&Value) -> Result<(), String>,
    example: fn() -> Value,
}

impl BodySchema {
    /// Schema for `T`, using `T::default()` as the example.
    pub fn of<T>() -> Self
    where
        T: DeserializeOwned + Serialize + Default,
    {
        Self {
            validate: |value| {
                serde_json::from_value::<T>(value.clone())
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            },
            example: || serde_json::to_value(T::default()).unwrap_or(Value::Null),
        }
    }

    /// Check a body against the schema.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error message.
    pub fn validate(&self, body: &Value) -> Result<(), String> {
        (self.validate)(body)
    }

    /// Example body for error responses.
    pub fn example(&self) -> Value {
        (self.example)()
    }
}

impl fmt::Debug for BodySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySchema")
            .field("example", &self.example())
            .finish()
    }
}

/// A route descriptor.
#[derive(Clone)]
pub struct Path {
    pub handler: Handler,
    pub description: &'static str,
    pub fields: Vec<Field>,
    pub body: Option<BodySchema>,
    pub skip_auth: bool,
}

impl Path {
    /// A route with no declared fields or body.
    pub fn new(handler: Handler, description: &'static str) -> Self {
        Self {
            handler,
            description,
            fields: Vec::new(),
            body: None,
            skip_auth: false,
        }
    }

    /// Document a path parameter.
    #[must_use]
    pub fn field(mut self, name: &'static str, description: &'static str) -> Self {
        self.fields.push(Field { name, description });
        self
    }

    /// Require a JSON body of type `T`.
    #[must_use]
    pub fn body<T>(mut self) -> Self
    where
        T: DeserializeOwned + Serialize + Default,
    {
        self.body = Some(BodySchema::of::<T>());
        self
    }

    /// Serve this route without authentication.
    #[must_use]
    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Path")
            .field("description", &self.description)
            .field("fields", &self.fields)
            .field("body", &self.body)
            .field("skip_auth", &self.skip_auth)
            .finish_non_exhaustive()
    }
}

/// All routes of an engine, keyed by method and pattern.
#[derive(Debug, Clone, Default)]
pub struct Paths {
    routes: BTreeMap<Method, BTreeMap<String, Path>>,
}

impl Paths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route.
    #[must_use]
    pub fn route(mut self, method: Method, pattern: impl Into<String>, path: Path) -> Self {
        self.routes
            .entry(method)
            .or_default()
            .insert(pattern.into(), path);
        self
    }

    /// Iterate `(method, pattern, path)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (Method, &str, &Path)> {
        self.routes.iter().flat_map(|(method, patterns)| {
            patterns
                .iter()
                .map(move |(pattern, path)| (*method, pattern.as_str(), path))
        })
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A pluggable engine.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Mount point without a leading slash, e.g. `secrets/kv`.
    fn root_path(&self) -> &'static str;

    /// One-paragraph description shown to operators.
    fn help(&self) -> &'static str;

    /// Route table. Patterns are absolute engine paths such as
    /// `/secrets/kv/:key`.
    fn paths(&self) -> Paths;

    /// Validate and persist configuration, then start the engine.
    ///
    /// Returns `304` if already enabled and `400` for missing configuration.
    async fn enable(&self, req: &LogicalRequest) -> Result<LogicalResponse, EngineError>;

    /// Reload persisted configuration after an unseal.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotEnabled`] if the engine was never enabled.
    async fn post_unseal(&self) -> Result<(), EngineError>;

    /// The installed router, if the engine is live.
    async fn router(&self) -> Option<Arc<BackendRouter>>;

    /// Install the router built from [`Backend::paths`].
    async fn set_router(&self, router: Arc<BackendRouter>);

    /// Forget loaded params and the router, as if never enabled in this
    /// process. Persisted params are kept.
    async fn unload(&self);

    /// This engine as an authorizer, for auth engines.
    fn authorizer(self: Arc<Self>) -> Option<Arc<dyn AuthorizeBackend>> {
        None
    }
}

/// An engine that can authenticate requests.
#[async_trait]
pub trait AuthorizeBackend: Send + Sync {
    /// `Ok(true)` if the request carries a credential this engine accepts.
    async fn authorize(&self, req: &LogicalRequest) -> Result<bool, EngineError>;
}

/// Persisted engine configuration.
#[derive(Debug, Clone)]
pub struct ParamsRepository {
    storage: LogicalStorage,
}

impl ParamsRepository {
    const KEY: &'static str = "params";

    /// A repository in the engine's own storage view.
    pub fn new(engine_storage: &LogicalStorage) -> Self {
        Self {
            storage: engine_storage.clone(),
        }
    }

    /// Load params, `None` if the engine was never enabled.
    ///
    /// # Errors
    ///
    /// Returns barrier or deserialization errors.
    pub async fn get<P: DeserializeOwned>(&self) -> Result<Option<P>, EngineError> {
        match self.storage.get_ok(Self::KEY).await? {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Persist params, replacing previous ones.
    ///
    /// # Errors
    ///
    /// Returns barrier or serialization errors.
    pub async fn put<P: Serialize + Sync>(&self, params: &P) -> Result<(), EngineError> {
        let value = serde_json::to_string(params)?;
        self.storage.update(Self::KEY, &value, None).await?;
        Ok(())
    }
}

/// State shared by every engine implementation.
///
/// `params` is the engine's read/write lock: handlers hold a read guard for
/// the whole request, `enable` and `post_unseal` take the write guard.
pub struct EngineState<P> {
    name: &'static str,
    exist: AtomicBool,
    params: RwLock<Option<P>>,
    router: RwLock<Option<Arc<BackendRouter>>>,
}

impl<P> EngineState<P> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            exist: AtomicBool::new(false),
            params: RwLock::new(None),
            router: RwLock::new(None),
        }
    }

    /// Whether the engine has been enabled or restored.
    pub fn is_enabled(&self) -> bool {
        self.exist.load(Ordering::SeqCst)
    }

    /// Mark the engine enabled. Call while holding the write guard.
    pub fn set_enabled(&self) {
        self.exist.store(true, Ordering::SeqCst);
    }

    /// Shared access to the loaded params.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotEnabled`] if no params are loaded.
    pub async fn read(&self) -> Result<RwLockReadGuard<'_, P>, EngineError> {
        RwLockReadGuard::try_map(self.params.read().await, Option::as_ref).map_err(|_| {
            EngineError::NotEnabled {
                engine: self.name.to_owned(),
            }
        })
    }

    /// Exclusive access for enable and post-unseal.
    pub async fn write(&self) -> RwLockWriteGuard<'_, Option<P>> {
        self.params.write().await
    }

    pub async fn router(&self) -> Option<Arc<BackendRouter>> {
        self.router.read().await.clone()
    }

    pub async fn set_router(&self, router: Arc<BackendRouter>) {
        *self.router.write().await = Some(router);
    }

    pub async fn unload(&self) {
        let mut params = self.params.write().await;
        *self.router.write().await = None;
        *params = None;
        self.exist.store(false, Ordering::SeqCst);
    }

    /// The error returned when params are missing after an unseal.
    pub fn not_enabled(&self) -> EngineError {
        EngineError::NotEnabled {
            engine: self.name.to_owned(),
        }
    }
}

impl<P> fmt::Debug for EngineState<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineState")
            .field("name", &self.name)
            .field("exist", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Body {
        key: String,
    }

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("DELETE".parse::<Method>().unwrap(), Method::Delete);
        assert!("TRACE".parse::<Method>().is_err());
    }

    #[test]
    fn request_normalizes_path_and_headers() {
        let req = LogicalRequest::new(Method::Get, "secrets/kv").with_header("X-Secman-Token", "t");
        assert_eq!(req.path, "/secrets/kv");
        assert_eq!(req.header("x-secman-token"), Some("t"));
    }

    #[test]
    fn body_schema_validates_and_describes() {
        let schema = BodySchema::of::<Body>();
        assert!(schema.validate(&json!({"key": "a"})).is_ok());
        assert!(schema.validate(&json!({"nope": 1})).is_err());
        assert_eq!(schema.example(), json!({"key": ""}));
    }

    #[test]
    fn params_bind_and_param() {
        let mut params = LogicalParams {
            body: Some(json!({"key": "a"})),
            ..LogicalParams::default()
        };
        params.params.insert("key".to_owned(), "a".to_owned());

        assert_eq!(params.bind::<Body>().unwrap().key, "a");
        assert_eq!(params.param("key").unwrap(), "a");
        assert!(matches!(
            params.param("missing"),
            Err(EngineError::TypeCast { .. })
        ));
        assert!(matches!(
            LogicalParams::default().bind::<Body>(),
            Err(EngineError::TypeCast { .. })
        ));
    }

    #[tokio::test]
    async fn engine_state_read_requires_params() {
        let state: EngineState<u32> = EngineState::new("test");
        assert!(matches!(
            state.read().await,
            Err(EngineError::NotEnabled { .. })
        ));

        *state.write().await = Some(7);
        state.set_enabled();
        assert!(state.is_enabled());
        assert_eq!(*state.read().await.unwrap(), 7);

        state.unload().await;
        assert!(!state.is_enabled());
        assert!(state.read().await.is_err());
    }

    #[test]
    fn paths_iterate_all_routes() {
        let noop = Arc::new(|_: LogicalRequest, _: LogicalParams| -> HandlerFuture {
            Box::pin(async { Ok(LogicalResponse::no_content()) })
        }) as Handler;
        let paths = Paths::new()
            .route(Method::Get, "/a", Path::new(Arc::clone(&noop), "a"))
            .route(Method::Post, "/a", Path::new(noop, "b"));
        assert_eq!(paths.len(), 2);
        assert_eq!(paths.iter().count(), 2);
    }
}
