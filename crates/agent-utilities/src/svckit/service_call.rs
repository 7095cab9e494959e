//! Internal Service Call Utility
//!
//! Calls an internal HTTP service on behalf of the calling node. The node's
//! identity and lineage travel as request headers so the downstream service
//! can authorize and attribute the work.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::json;

use agent_core::{
    ExecuteResult, ExecutionContext, Result as CoreResult, Utility, UtilityDescriptor,
};

use crate::error::{Result, UtilityError};

/// Where internal services live
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceCallConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for ServiceCallConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceCallConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `SERVICE_BASE_URL` and `SERVICE_TIMEOUT_SECS`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(base_url) = lookup("SERVICE_BASE_URL") {
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                return Err(UtilityError::Config(format!(
                    "SERVICE_BASE_URL must be an http(s) URL, got '{base_url}'"
                )));
            }
            config.base_url = base_url;
        }
        if let Some(raw) = lookup("SERVICE_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                UtilityError::Config(format!("SERVICE_TIMEOUT_SECS must be a number, got '{raw}'"))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Join a relative service path onto the base URL
    pub fn url_for(&self, path: &str) -> Result<String> {
        if !path.starts_with('/') || path.starts_with("//") || path.contains("://") {
            return Err(UtilityError::InvalidPath(path.to_string()));
        }
        Ok(format!("{}{path}", self.base_url.trim_end_matches('/')))
    }
}

/// Utility that calls internal services with the caller's identity
pub struct ServiceCallUtility {
    client: Client,
    config: ServiceCallConfig,
}

impl ServiceCallUtility {
    pub const ID: &'static str = "service_call";

    pub fn new(config: ServiceCallConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        payload: Option<&serde_json::Value>,
        ctx: &ExecutionContext,
    ) -> Result<ExecuteResult> {
        let url = self.config.url_for(path)?;
        tracing::debug!(%url, %method, node_id = %ctx.node_id(), "Calling internal service");

        let mut request = self.client.request(method, &url);
        for (name, value) in ctx.headers() {
            request = request.header(name, value);
        }
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            tracing::info!(%url, status = status.as_u16(), "Internal service call failed");
            return Err(UtilityError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let data = serde_json::from_str::<serde_json::Value>(&body)
            .unwrap_or_else(|_| serde_json::Value::String(body.clone()));
        Ok(ExecuteResult::success(body).with_data(json!({
            "status": status.as_u16(),
            "body": data,
        })))
    }
}

#[async_trait]
impl Utility for ServiceCallUtility {
    fn descriptor(&self) -> UtilityDescriptor {
        UtilityDescriptor::new(
            Self::ID,
            "Call an internal service endpoint on behalf of the current user.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "pattern": "^/",
                        "description": "Service path, e.g. '/v1/orders/42'"
                    },
                    "method": {
                        "type": "string",
                        "enum": ["GET", "POST"],
                        "description": "HTTP method (default: POST)"
                    },
                    "payload": {
                        "type": "object",
                        "description": "JSON body for POST requests"
                    }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
        )
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ExecutionContext,
    ) -> CoreResult<ExecuteResult> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let method = match args.get("method").and_then(|v| v.as_str()) {
            Some("GET") => Method::GET,
            _ => Method::POST,
        };
        let payload = args.get("payload").filter(|_| method == Method::POST);

        Ok(self.call(method, path, payload, ctx).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use agent_core::provenance::{NodeGraph, NodeType, ProvenanceHandle};
    use agent_core::{ConversationId, IdentityContext, RunId, UtilityRegistry};
    use axum::{Json, Router, http::HeaderMap, http::StatusCode, routing::post};
    use parking_lot::Mutex;

    fn context() -> ExecutionContext {
        let graph = ProvenanceHandle::new(NodeGraph::root(
            IdentityContext::new("user-7")
                .with_organization("org-3")
                .with_platform_user("pu-9")
                .with_credential("s3cret"),
        ));
        let root = graph.root_node();
        let node = graph.mint_child(&root.id, NodeType::Tool).unwrap();
        ExecutionContext::new(RunId::new(), ConversationId::from_string("conv-1"), node, graph)
    }

    async fn spawn_service(seen: Arc<Mutex<Vec<HeaderMap>>>) -> String {
        let app = Router::new()
            .route(
                "/v1/echo",
                post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().push(headers);
                        Json(json!({ "echo": body }))
                    }
                }),
            )
            .route(
                "/v1/down",
                post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn utility(base_url: String) -> ServiceCallUtility {
        ServiceCallUtility::new(ServiceCallConfig {
            base_url,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn url_join_rejects_absolute_targets() {
        let config = ServiceCallConfig::default();
        assert_eq!(
            config.url_for("/v1/x").unwrap(),
            "http://localhost:8080/v1/x"
        );
        assert!(config.url_for("v1/x").is_err());
        assert!(config.url_for("//evil.example/x").is_err());
        assert!(config.url_for("/redirect?to=http://evil").is_err());
    }

    #[test]
    fn config_from_lookup() {
        let config = ServiceCallConfig::from_lookup(|key| match key {
            "SERVICE_BASE_URL" => Some("https://svc.internal/".into()),
            "SERVICE_TIMEOUT_SECS" => Some("3".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.url_for("/a").unwrap(), "https://svc.internal/a");
        assert_eq!(config.timeout, Duration::from_secs(3));

        assert!(ServiceCallConfig::from_lookup(|_| Some("ftp://x".into())).is_err());
    }

    #[tokio::test]
    async fn forwards_identity_and_lineage_headers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base = spawn_service(seen.clone()).await;
        let ctx = context();

        let result = utility(base)
            .execute(
                &json!({ "path": "/v1/echo", "payload": { "q": 1 } }),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.data.unwrap()["body"]["echo"]["q"], json!(1));

        let seen = seen.lock();
        let headers = &seen[0];
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        assert_eq!(header("x-user-id").as_deref(), Some("user-7"));
        assert_eq!(header("x-organization-id").as_deref(), Some("org-3"));
        assert_eq!(header("x-platform-user-id").as_deref(), Some("pu-9"));
        assert_eq!(header("authorization").as_deref(), Some("Bearer s3cret"));
        assert_eq!(header("x-conversation-id").as_deref(), Some("conv-1"));
        assert_eq!(header("x-node-id"), Some(ctx.node_id().to_string()));
        assert_eq!(
            header("x-parent-node-id"),
            ctx.node.parent_id.as_ref().map(ToString::to_string)
        );
    }

    #[tokio::test]
    async fn non_success_status_is_an_execution_failure() {
        let base = spawn_service(Arc::new(Mutex::new(Vec::new()))).await;
        let mut registry = UtilityRegistry::new();
        registry.register(utility(base)).unwrap();

        let err = registry
            .dispatch("service_call", &json!({ "path": "/v1/down" }), &context())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "execution_failed");
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn unreachable_service_is_an_execution_failure() {
        let mut registry = UtilityRegistry::new();
        registry
            .register(utility("http://127.0.0.1:9".into()))
            .unwrap();

        let err = registry
            .dispatch("service_call", &json!({ "path": "/v1/echo" }), &context())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution_failed");
    }
}
