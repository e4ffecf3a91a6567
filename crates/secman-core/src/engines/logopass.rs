//! Login/password authentication.
//!
//! Users register and log in through IAM. A successful login opens an IAM
//! session and hands the client an HS256 JWT carrying the session id; the
//! engine's [`AuthorizeBackend`] implementation accepts requests whose
//! `Authorization: Bearer` token decodes and points at a live session.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::backend::{
    AuthorizeBackend, Backend, EngineState, LogicalParams, LogicalRequest, LogicalResponse,
    Method, ParamsRepository, Path, Paths, handler,
};
use crate::backend_router::BackendRouter;
use crate::crypto::random_bytes;
use crate::error::{EngineError, IamError};
use crate::iam::IamCore;
use crate::logical_storage::LogicalStorage;

pub const ROOT_PATH: &str = "auth/logopass";

/// Session lifetime when none is configured.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

const SECRET_KEY_BYTES: usize = 32;

static BEARER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^Bearer\s+(\S+)$").ok());

/// Persisted engine configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogopassParams {
    /// Session lifetime in seconds, `0` for the default.
    pub token_ttl: u64,
    /// HMAC key for issued JWTs.
    pub secret_key: String,
}

impl LogopassParams {
    fn ttl(&self) -> Duration {
        if self.token_ttl == 0 {
            DEFAULT_TOKEN_TTL
        } else {
            Duration::from_secs(self.token_ttl)
        }
    }
}

impl std::fmt::Debug for LogopassParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogopassParams")
            .field("token_ttl", &self.token_ttl)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsBody {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateParamsBody {
    pub token_ttl: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    sid: String,
    iat: i64,
    exp: i64,
}

/// The `auth/logopass` engine.
#[derive(Clone)]
pub struct LogopassBackend {
    state: Arc<EngineState<LogopassParams>>,
    params: ParamsRepository,
    iam: Arc<IamCore>,
}

impl LogopassBackend {
    pub fn new(storage: LogicalStorage, iam: Arc<IamCore>) -> Self {
        Self {
            state: Arc::new(EngineState::new(ROOT_PATH)),
            params: ParamsRepository::new(&storage),
            iam,
        }
    }

    async fn register(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let _params = self.state.read().await?;
        let body: CredentialsBody = p.bind()?;
        if body.login.is_empty() || body.password.is_empty() {
            return Ok(LogicalResponse::bad_request("login and password are required"));
        }
        match self.iam.register(&body.login, &body.password).await {
            Ok(_) => Ok(LogicalResponse::ok(json!({}))),
            Err(IamError::UserAlreadyExists { .. }) => Ok(LogicalResponse::bad_request(
                "user with this login already exists",
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn login(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let params = self.state.read().await?;
        let body: CredentialsBody = p.bind()?;
        let user = match self.iam.authenticate(&body.login, &body.password).await {
            Ok(user) => user,
            Err(IamError::InvalidCredentials) => {
                return Ok(LogicalResponse::error(401, "invalid credentials"));
            }
            Err(e) => return Err(e.into()),
        };

        let session = self.iam.login(&user.login, ROOT_PATH, params.ttl()).await?;
        let claims = Claims {
            sub: session.sub,
            sid: session.id,
            iat: session.created_at.timestamp(),
            exp: session.expired_at.timestamp(),
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(params.secret_key.as_bytes()),
        )
        .map_err(|e| EngineError::Internal {
            reason: format!("cannot sign token: {e}"),
        })?;
        info!(login = %user.login, "logopass login");
        Ok(LogicalResponse::ok(json!({ "token": token })))
    }

    async fn show_params(self, _req: LogicalRequest, _p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let params = self.state.read().await?;
        Ok(LogicalResponse::ok(json!({ "token_ttl": params.ttl().as_secs() })))
    }

    async fn update_params(self, _req: LogicalRequest, p: LogicalParams) -> Result<LogicalResponse, EngineError> {
        let body: UpdateParamsBody = p.bind()?;
        let mut guard = self.state.write().await;
        let Some(params) = guard.as_mut() else {
            return Err(self.state.not_enabled());
        };
        let mut updated = params.clone();
        updated.token_ttl = body.token_ttl;
        self.params.put(&updated).await?;
        let ttl = updated.ttl().as_secs();
        *params = updated;
        Ok(LogicalResponse::ok(json!({ "token_ttl": ttl })))
    }

    fn claims(token: &str, secret_key: &str) -> Option<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        match jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret_key.as_bytes()),
            &validation,
        ) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                debug!(error = %e, "logopass: rejected token");
                None
            }
        }
    }
}

#[async_trait]
impl Backend for LogopassBackend {
    fn root_path(&self) -> &'static str {
        ROOT_PATH
    }

    fn help(&self) -> &'static str {
        "Logopass backend, authenticates users by login and password"
    }

    fn paths(&self) -> Paths {
        Paths::new()
            .route(
                Method::Post,
                "/auth/logopass/register",
                Path::new(handler(self, Self::register), "Register a user")
                    .body::<CredentialsBody>()
                    .skip_auth(),
            )
            .route(
                Method::Post,
                "/auth/logopass/login",
                Path::new(handler(self, Self::login), "Log in and receive a bearer token")
                    .body::<CredentialsBody>()
                    .skip_auth(),
            )
            .route(
                Method::Get,
                "/auth/logopass/params",
                Path::new(handler(self, Self::show_params), "Get the engine params"),
            )
            .route(
                Method::Put,
                "/auth/logopass/params",
                Path::new(handler(self, Self::update_params), "Update the token TTL")
                    .body::<UpdateParamsBody>(),
            )
    }

    async fn enable(&self, req: &LogicalRequest) -> Result<LogicalResponse, EngineError> {
        let mut guard = self.state.write().await;
        if self.state.is_enabled() {
            return Ok(LogicalResponse::not_modified());
        }

        let mut params = match req.body.clone() {
            None => LogopassParams::default(),
            Some(body) => match serde_json::from_value::<LogopassParams>(body) {
                Ok(params) => params,
                Err(_) => return Ok(LogicalResponse::message(400, "body is invalid or empty")),
            },
        };
        if params.secret_key.is_empty() {
            params.secret_key = BASE64.encode(random_bytes(SECRET_KEY_BYTES));
        }

        self.params.put(&params).await?;
        *guard = Some(params);
        self.state.set_enabled();
        info!(engine = ROOT_PATH, "logopass enabled");
        Ok(LogicalResponse::message(200, "logopass enabled"))
    }

    async fn post_unseal(&self) -> Result<(), EngineError> {
        let mut guard = self.state.write().await;
        let params: LogopassParams = self
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

    fn authorizer(self: Arc<Self>) -> Option<Arc<dyn AuthorizeBackend>> {
        Some(self)
    }
}

#[async_trait]
impl AuthorizeBackend for LogopassBackend {
    async fn authorize(&self, req: &LogicalRequest) -> Result<bool, EngineError> {
        if let Some(router) = self.state.router().await {
            if router.skips_auth(req.method, &req.path) {
                return Ok(true);
            }
        }

        let Some(header) = req.header("authorization") else {
            return Ok(false);
        };
        let Some(token) = BEARER
            .as_ref()
            .and_then(|re| re.captures(header))
            .and_then(|caps| caps.get(1))
        else {
            return Ok(false);
        };

        let params = self.state.read().await?;
        let Some(claims) = Self::claims(token.as_str(), &params.secret_key) else {
            return Ok(false);
        };
        match self.iam.authorize(&claims.sid).await {
            Ok(session) => Ok(session.sub == claims.sub),
            Err(IamError::SessionNotFound | IamError::SessionExpired) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::barrier::{BarrierStorage, UnsealedBarrier};
    use crate::engines::tests::call;
    use secman_storage::MemoryBackend;

    fn backend() -> (LogopassBackend, Arc<IamCore>, LogicalStorage) {
        let barrier: Arc<dyn BarrierStorage> =
            Arc::new(UnsealedBarrier::new(Arc::new(MemoryBackend::new())));
        let iam = Arc::new(IamCore::new(Arc::clone(&barrier)));
        let storage = LogicalStorage::new(barrier, ROOT_PATH);
        (LogopassBackend::new(storage.clone(), Arc::clone(&iam)), iam, storage)
    }

    async fn enabled(body: Option<Value>) -> LogopassBackend {
        let (logopass, _iam, _storage) = backend();
        let mut req = LogicalRequest::new(Method::Post, "/sys/auth/enable/auth/logopass");
        if let Some(body) = body {
            req = req.with_body(body);
        }
        assert_eq!(logopass.enable(&req).await.unwrap().status, 200);
        let router = BackendRouter::new(&logopass.paths()).unwrap();
        logopass.set_router(Arc::new(router)).await;
        logopass
    }

    async fn token(logopass: &LogopassBackend) -> String {
        let creds = json!({ "login": "alice", "password": "wonderland" });
        let res = call(logopass, Method::Post, "/auth/logopass/register", Some(creds.clone())).await;
        assert_eq!(res.status, 200);
        let res = call(logopass, Method::Post, "/auth/logopass/login", Some(creds)).await;
        assert_eq!(res.status, 200);
        res.json_body().unwrap()["token"].as_str().unwrap().to_owned()
    }

    fn bearer(token: &str) -> LogicalRequest {
        LogicalRequest::new(Method::Get, "/secrets/kv").with_header("authorization", &format!("Bearer {token}"))
    }

    #[tokio::test]
    async fn enable_generates_secret_and_default_ttl() {
        let (logopass, iam, storage) = backend();
        let req = LogicalRequest::new(Method::Post, "/");
        assert_eq!(logopass.enable(&req).await.unwrap().status, 200);
        assert_eq!(logopass.enable(&req).await.unwrap().status, 304);

        let params: LogopassParams = ParamsRepository::new(&storage).get().await.unwrap().unwrap();
        assert_eq!(BASE64.decode(&params.secret_key).unwrap().len(), SECRET_KEY_BYTES);
        assert_eq!(params.ttl(), DEFAULT_TOKEN_TTL);

        let restored = LogopassBackend::new(storage, iam);
        restored.post_unseal().await.unwrap();
        assert!(restored.state.is_enabled());
    }

    #[tokio::test]
    async fn enable_rejects_malformed_body() {
        let (logopass, _iam, _storage) = backend();
        let req = LogicalRequest::new(Method::Post, "/").with_body(json!({ "token_ttl": "soon" }));
        let res = logopass.enable(&req).await.unwrap();
        assert_eq!(res, LogicalResponse::message(400, "body is invalid or empty"));
        assert!(!logopass.state.is_enabled());
    }

    #[tokio::test]
    async fn register_validates_and_rejects_duplicates() {
        let logopass = enabled(None).await;
        let res = call(&logopass, Method::Post, "/auth/logopass/register", Some(json!({ "login": "", "password": "" }))).await;
        assert_eq!(res, LogicalResponse::bad_request("login and password are required"));

        let creds = json!({ "login": "bob", "password": "pw" });
        call(&logopass, Method::Post, "/auth/logopass/register", Some(creds.clone())).await;
        let res = call(&logopass, Method::Post, "/auth/logopass/register", Some(creds)).await;
        assert_eq!(res, LogicalResponse::bad_request("user with this login already exists"));
    }

    #[tokio::test]
    async fn login_with_wrong_password_is_unauthorized() {
        let logopass = enabled(None).await;
        token(&logopass).await;
        let creds = json!({ "login": "alice", "password": "nope" });
        let res = call(&logopass, Method::Post, "/auth/logopass/login", Some(creds)).await;
        assert_eq!(res, LogicalResponse::error(401, "invalid credentials"));
    }

    #[tokio::test]
    async fn bearer_token_authorizes() {
        let logopass = enabled(None).await;
        let token = token(&logopass).await;
        assert!(logopass.authorize(&bearer(&token)).await.unwrap());
        assert!(!logopass.authorize(&bearer("garbage")).await.unwrap());
        let no_header = LogicalRequest::new(Method::Get, "/secrets/kv");
        assert!(!logopass.authorize(&no_header).await.unwrap());
        let wrong_scheme = no_header.with_header("authorization", &format!("Basic {token}"));
        assert!(!logopass.authorize(&wrong_scheme).await.unwrap());
        let embedded = LogicalRequest::new(Method::Get, "/secrets/kv")
            .with_header("authorization", &format!("Basic x, Bearer {token}"));
        assert!(!logopass.authorize(&embedded).await.unwrap());
    }

    #[tokio::test]
    async fn token_from_another_key_is_rejected() {
        let first = enabled(None).await;
        let second = enabled(None).await;
        let token = token(&first).await;
        assert!(!second.authorize(&bearer(&token)).await.unwrap());
    }

    #[tokio::test]
    async fn skip_auth_paths_are_public() {
        let logopass = enabled(None).await;
        let req = LogicalRequest::new(Method::Post, "/auth/logopass/login");
        assert!(logopass.authorize(&req).await.unwrap());
        let req = LogicalRequest::new(Method::Get, "/auth/logopass/params");
        assert!(!logopass.authorize(&req).await.unwrap());
    }

    #[tokio::test]
    async fn params_can_be_read_and_updated() {
        let logopass = enabled(Some(json!({ "token_ttl": 60 }))).await;
        let res = call(&logopass, Method::Get, "/auth/logopass/params", None).await;
        assert_eq!(res.json_body().unwrap()["token_ttl"], 60);
        let res = call(&logopass, Method::Put, "/auth/logopass/params", Some(json!({ "token_ttl": 0 }))).await;
        assert_eq!(res.json_body().unwrap()["token_ttl"], DEFAULT_TOKEN_TTL.as_secs());
        assert!(!format!("{:?}", logopass.state.read().await.unwrap().clone()).contains("secret_key:"));
    }
}
