//! Per-engine method and path dispatch.
//!
//! Built once from an engine's [`Paths`]. Every pattern is compiled into an
//! anchored regex where `:name` segments capture one or more characters and
//! literal segments are escaped. Patterns are tried longest first, so
//! `/secrets/kv/:key/metadata` wins over `/secrets/kv/:key`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use regex::Regex;
use serde_json::json;
use tracing::debug;

use crate::backend::{LogicalParams, LogicalRequest, LogicalResponse, Method, Path, Paths};
use crate::error::{EngineError, RouterError};

struct Route {
    pattern: String,
    regex: Regex,
    names: Vec<String>,
    path: Path,
}

impl Route {
    fn compile(pattern: &str, path: Path) -> Result<Self, RouterError> {
        let mut names = Vec::new();
        let source = pattern
            .split('/')
            .map(|segment| match segment.strip_prefix(':') {
                Some(name) => {
                    names.push(name.to_owned());
                    "(.+)".to_owned()
                }
                None => regex::escape(segment),
            })
            .collect::<Vec<_>>()
            .join("/");

        let regex = Regex::new(&format!("^{source}$")).map_err(|e| RouterError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            pattern: pattern.to_owned(),
            regex,
            names,
            path,
        })
    }

    fn captures(&self, path: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(path)?;
        Some(
            self.names
                .iter()
                .zip(caps.iter().skip(1))
                .filter_map(|(name, m)| m.map(|m| (name.clone(), m.as_str().to_owned())))
                .collect(),
        )
    }
}

/// Dispatches requests to the handlers of one engine.
pub struct BackendRouter {
    routes: BTreeMap<Method, Vec<Route>>,
}

impl BackendRouter {
    /// Compile every route of `paths`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InvalidPattern`] if a pattern does not compile.
    pub fn new(paths: &Paths) -> Result<Self, RouterError> {
        let mut routes: BTreeMap<Method, Vec<Route>> = BTreeMap::new();
        for (method, pattern, path) in paths.iter() {
            routes
                .entry(method)
                .or_default()
                .push(Route::compile(pattern, path.clone())?);
        }
        for candidates in routes.values_mut() {
            candidates.sort_by(|a, b| b.pattern.len().cmp(&a.pattern.len()));
        }
        Ok(Self { routes })
    }

    fn find(&self, method: Method, path: &str) -> Option<(&Route, HashMap<String, String>)> {
        self.routes
            .get(&method)?
            .iter()
            .find_map(|route| route.captures(path).map(|params| (route, params)))
    }

    /// Whether the matching route is served without authentication.
    pub fn skips_auth(&self, method: Method, path: &str) -> bool {
        self.find(method, path)
            .is_some_and(|(route, _)| route.path.skip_auth)
    }

    /// Dispatch a request.
    ///
    /// Returns `Ok(None)` when no route matches, which callers report as
    /// `404`. Path or body mismatches produce a `400` response describing
    /// what the route expects.
    ///
    /// # Errors
    ///
    /// Propagates the handler's error unchanged.
    pub async fn handle(&self, req: LogicalRequest) -> Result<Option<LogicalResponse>, EngineError> {
        let Some((route, params)) = self.find(req.method, &req.path) else {
            return Ok(None);
        };

        if !route.path.fields.is_empty() && params.len() != route.path.fields.len() {
            let fields: Vec<_> = route
                .path
                .fields
                .iter()
                .map(|f| json!({ "name": f.name, "description": f.description }))
                .collect();
            return Ok(Some(LogicalResponse::json(
                400,
                json!({ "message": "unsupported path params", "fields": fields }),
            )));
        }

        let body = match route.path.body {
            Some(schema) => match &req.body {
                Some(body) if schema.validate(body).is_ok() => Some(body.clone()),
                _ => {
                    return Ok(Some(LogicalResponse::json(
                        400,
                        json!({ "message": "unsupported body schema", "schema": schema.example() }),
                    )));
                }
            },
            None => req.body.clone(),
        };

        debug!(
            method = %req.method,
            pattern = %route.pattern,
            route = route.path.description,
            "dispatching engine request"
        );
        (route.path.handler)(req, LogicalParams { params, body })
            .await
            .map(Some)
    }
}

impl fmt::Debug for BackendRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let patterns: Vec<String> = self
            .routes
            .iter()
            .flat_map(|(method, routes)| {
                routes
                    .iter()
                    .map(move |route| format!("{method} {}", route.pattern))
            })
            .collect();
        f.debug_struct("BackendRouter")
            .field("routes", &patterns)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    use super::*;
    use crate::backend::{Handler, HandlerFuture};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct CreateBody {
        key: String,
        value: String,
    }

    fn echo(tag: &'static str) -> Handler {
        Arc::new(move |_req: LogicalRequest, params: LogicalParams| -> HandlerFuture {
            Box::pin(async move {
                Ok(LogicalResponse::ok(json!({
                    "route": tag,
                    "params": params.params,
                    "body": params.body.unwrap_or(Value::Null),
                })))
            })
        })
    }

    fn router() -> BackendRouter {
        let paths = Paths::new()
            .route(Method::Get, "/secrets/kv", Path::new(echo("index"), "index"))
            .route(
                Method::Get,
                "/secrets/kv/:key",
                Path::new(echo("show"), "show").field("key", "key"),
            )
            .route(
                Method::Get,
                "/secrets/kv/:key/metadata",
                Path::new(echo("metadata"), "metadata"),
            )
            .route(
                Method::Post,
                "/secrets/kv",
                Path::new(echo("create"), "create").body::<CreateBody>(),
            )
            .route(
                Method::Post,
                "/secrets/kv/login",
                Path::new(echo("login"), "login").skip_auth(),
            );
        BackendRouter::new(&paths).unwrap()
    }

    async fn call(router: &BackendRouter, req: LogicalRequest) -> Option<Value> {
        router
            .handle(req)
            .await
            .unwrap()
            .map(|resp| resp.json_body().cloned().unwrap())
    }

    #[tokio::test]
    async fn captures_path_params() {
        let body = call(&router(), LogicalRequest::new(Method::Get, "/secrets/kv/db_password"))
            .await
            .unwrap();
        assert_eq!(body["route"], "show");
        assert_eq!(body["params"]["key"], "db_password");
    }

    #[tokio::test]
    async fn longer_pattern_wins() {
        let body = call(&router(), LogicalRequest::new(Method::Get, "/secrets/kv/a/metadata"))
            .await
            .unwrap();
        assert_eq!(body["route"], "metadata");
        assert_eq!(body["params"]["key"], "a");
    }

    #[tokio::test]
    async fn patterns_are_anchored() {
        let router = router();
        assert!(call(&router, LogicalRequest::new(Method::Get, "/prefix/secrets/kv")).await.is_none());
        assert!(call(&router, LogicalRequest::new(Method::Delete, "/secrets/kv/a")).await.is_none());
    }

    #[tokio::test]
    async fn literal_segments_are_escaped() {
        let paths = Paths::new().route(Method::Get, "/a.b", Path::new(echo("dot"), "dot"));
        let router = BackendRouter::new(&paths).unwrap();
        assert!(call(&router, LogicalRequest::new(Method::Get, "/axb")).await.is_none());
        assert!(call(&router, LogicalRequest::new(Method::Get, "/a.b")).await.is_some());
    }

    #[tokio::test]
    async fn invalid_body_returns_schema() {
        let resp = router()
            .handle(LogicalRequest::new(Method::Post, "/secrets/kv").with_body(json!({"key": 1})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.status, 400);
        let body = resp.json_body().unwrap();
        assert_eq!(body["message"], "unsupported body schema");
        assert_eq!(body["schema"], json!({"key": "", "value": ""}));
    }

    #[tokio::test]
    async fn missing_body_is_rejected() {
        let resp = router()
            .handle(LogicalRequest::new(Method::Post, "/secrets/kv"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.status, 400);
    }

    #[tokio::test]
    async fn valid_body_is_passed_through() {
        let body = call(
            &router(),
            LogicalRequest::new(Method::Post, "/secrets/kv").with_body(json!({"key": "a", "value": "b"})),
        )
        .await
        .unwrap();
        assert_eq!(body["route"], "create");
        assert_eq!(body["body"]["value"], "b");
    }

    #[tokio::test]
    async fn declared_fields_must_match_captures() {
        let paths = Paths::new().route(
            Method::Get,
            "/items/:id",
            Path::new(echo("item"), "item")
                .field("id", "item id")
                .field("version", "item version"),
        );
        let resp = BackendRouter::new(&paths)
            .unwrap()
            .handle(LogicalRequest::new(Method::Get, "/items/1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.status, 400);
        assert_eq!(resp.json_body().unwrap()["message"], "unsupported path params");
    }

    #[test]
    fn skip_auth_is_per_route() {
        let router = router();
        assert!(router.skips_auth(Method::Post, "/secrets/kv/login"));
        assert!(!router.skips_auth(Method::Post, "/secrets/kv"));
        assert!(!router.skips_auth(Method::Get, "/secrets/kv/login"));
    }
}
