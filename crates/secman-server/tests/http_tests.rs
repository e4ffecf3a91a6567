//! End-to-end tests of the HTTP surface against an in-memory core.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use secman_core::barrier::SealConfig;
use secman_core::engines::blobs::MemoryBlobStoreFactory;
use secman_server::{build_state, routes};
use secman_storage::MemoryBackend;

async fn app() -> Router {
    let state = build_state(
        Arc::new(MemoryBackend::new()),
        SealConfig::new(3, 2).unwrap(),
        Arc::new(MemoryBlobStoreFactory::new()),
    )
    .await
    .unwrap();
    routes::router(state)
}

struct Call<'a> {
    method: &'a str,
    uri: &'a str,
    headers: Vec<(&'a str, String)>,
    body: Option<Value>,
}

impl<'a> Call<'a> {
    fn new(method: &'a str, uri: &'a str) -> Self {
        Self {
            method,
            uri,
            headers: Vec::new(),
            body: None,
        }
    }

    fn token(mut self, token: &str) -> Self {
        self.headers.push(("x-secman-token", token.to_owned()));
        self
    }

    fn bearer(mut self, jwt: &str) -> Self {
        self.headers.push(("authorization", format!("Bearer {jwt}")));
        self
    }

    fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    async fn send(self, app: &Router) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(self.method).uri(self.uri);
        for (name, value) in &self.headers {
            builder = builder.header(*name, value);
        }
        let body = match self.body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let res = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }
}

/// Initialize and fully unseal, returning the root token.
async fn unsealed(app: &Router) -> String {
    let (status, body) = Call::new("POST", "/api/sys/init").send(app).await;
    assert_eq!(status, StatusCode::OK);
    let root = body["root_token"].as_str().unwrap().to_owned();
    let shares: Vec<String> = serde_json::from_value(body["thresholds"].clone()).unwrap();
    assert_eq!(shares.len(), 3);

    for share in shares.iter().take(2) {
        let (status, _) = Call::new("POST", "/api/sys/unseal")
            .token(&root)
            .json(json!({ "key": share }))
            .send(app)
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    root
}

#[tokio::test]
async fn status_reports_lifecycle() {
    let app = app().await;
    let (status, body) = Call::new("GET", "/api/sys/status").send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["initialized"], false);
    assert_eq!(body["sealed"], true);

    unsealed(&app).await;
    let (_, body) = Call::new("GET", "/api/sys/status").send(&app).await;
    assert_eq!(body["initialized"], true);
    assert_eq!(body["sealed"], false);
}

#[tokio::test]
async fn gates_apply_in_order() {
    let app = app().await;
    let (status, body) = Call::new("POST", "/api/sys/unseal").send(&app).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "not_initialized");

    let (_, body) = Call::new("POST", "/api/sys/init").send(&app).await;
    let root = body["root_token"].as_str().unwrap().to_owned();

    let (status, body) = Call::new("GET", "/api/engine/secrets/kv").token(&root).send(&app).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "sealed");

    let (status, _) = Call::new("POST", "/api/sys/unseal").send(&app).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = Call::new("POST", "/api/sys/unseal").token("forged").send(&app).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn init_twice_is_not_modified() {
    let app = app().await;
    unsealed(&app).await;
    let (status, _) = Call::new("POST", "/api/sys/init").send(&app).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn unseal_validates_key() {
    let app = app().await;
    let (_, body) = Call::new("POST", "/api/sys/init").send(&app).await;
    let root = body["root_token"].as_str().unwrap().to_owned();

    let (status, body) = Call::new("POST", "/api/sys/unseal").token(&root).send(&app).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "key is missing");

    let (status, body) = Call::new("POST", "/api/sys/unseal")
        .token(&root)
        .json(json!({ "key": "not base64!" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "invalid key");
}

#[tokio::test]
async fn foreign_shares_are_rejected() {
    let app = app().await;
    let (_, body) = Call::new("POST", "/api/sys/init").send(&app).await;
    let root = body["root_token"].as_str().unwrap().to_owned();

    let other = self::app().await;
    let (_, foreign) = Call::new("POST", "/api/sys/init").send(&other).await;

    let (status, body) = Call::new("POST", "/api/sys/unseal")
        .token(&root)
        .json(json!({ "key": foreign["thresholds"][0] }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sealed"], true);
    assert_eq!(body["progress"]["collected"], 1);

    let (status, _) = Call::new("POST", "/api/sys/unseal")
        .token(&root)
        .json(json!({ "key": foreign["thresholds"][1] }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = Call::new("GET", "/api/sys/status").send(&app).await;
    assert_eq!(body["sealed"], true);
}

#[tokio::test]
async fn unseal_when_unsealed_is_not_modified() {
    let app = app().await;
    let root = unsealed(&app).await;
    let (status, _) = Call::new("POST", "/api/sys/unseal")
        .token(&root)
        .json(json!({ "key": "AAAA" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn kv_through_http() {
    let app = app().await;
    let root = unsealed(&app).await;

    let (status, _) = Call::new("POST", "/api/sys/engines/enable/secrets/kv").token(&root).send(&app).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = Call::new("POST", "/api/sys/engines/enable/secrets/kv").token(&root).send(&app).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    let (status, _) = Call::new("POST", "/api/sys/engines/enable/secrets/nope").token(&root).send(&app).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = Call::new("POST", "/api/engine/secrets/kv")
        .token(&root)
        .json(json!({ "key": "db", "value": "hunter2" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = Call::new("GET", "/api/engine/secrets/kv/db").token(&root).send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "hunter2");

    let (status, _) = Call::new("GET", "/api/engine/secrets/kv/db").send(&app).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = Call::new("GET", "/api/engine/secrets/kv/missing").token(&root).send(&app).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "key not found", "key": "missing" }));
}

#[tokio::test]
async fn disabled_engine_is_not_found() {
    let app = app().await;
    let root = unsealed(&app).await;
    let (status, _) = Call::new("GET", "/api/engine/secrets/pci_dss").token(&root).send(&app).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn logopass_bearer_tokens_open_engines() {
    let app = app().await;
    let root = unsealed(&app).await;

    for engine in ["secrets/kv", "auth/logopass"] {
        let (status, _) = Call::new("POST", &format!("/api/sys/engines/enable/{engine}"))
            .token(&root)
            .send(&app)
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, _) = Call::new("POST", "/api/sys/auth/enable")
        .token(&root)
        .json(json!({ "engine_path": "secrets/kv" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = Call::new("POST", "/api/sys/auth/enable")
        .token(&root)
        .json(json!({ "engine_path": "auth/logopass" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "auth enabled");

    let creds = json!({ "login": "alice", "password": "wonderland" });
    let (status, _) = Call::new("POST", "/api/engine/auth/logopass/register")
        .json(creds.clone())
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = Call::new("POST", "/api/engine/auth/logopass/login")
        .json(creds)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    let jwt = body["token"].as_str().unwrap().to_owned();

    let (status, body) = Call::new("GET", "/api/engine/secrets/kv").bearer(&jwt).send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entries"], json!([]));

    let (status, _) = Call::new("GET", "/api/engine/secrets/kv").bearer("nonsense").send(&app).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn auth_engine_must_be_enabled_first() {
    let app = app().await;
    let root = unsealed(&app).await;

    let (status, body) = Call::new("POST", "/api/sys/auth/enable")
        .token(&root)
        .json(json!({ "engine_path": "auth/logopass" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "engine at 'auth/logopass' is not enabled");

    let (status, _) = Call::new("POST", "/api/sys/engines/enable/secrets/kv")
        .token(&root)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = Call::new("GET", "/api/engine/secrets/kv/x").bearer("jwt").send(&app).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn security_headers_are_set() {
    let app = app().await;
    let res = app
        .oneshot(Request::builder().uri("/api/sys/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.headers()["x-content-type-options"], "nosniff");
    assert_eq!(res.headers()["cache-control"], "no-store");
}
