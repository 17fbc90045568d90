use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::RuleConfig;

/// A route as the agent reports and accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentRoute {
    pub table: u32,
    pub iface: String,
    pub address: String,
}

/// The privileged network agent's RPC surface. The controller only ever
/// issues one call at a time; any failure is retried by the next reconcile.
#[async_trait]
pub trait NetworkAgent: Send + Sync {
    async fn has_rule(&self, rule: &RuleConfig) -> anyhow::Result<bool>;
    async fn add_rule(&self, rule: &RuleConfig) -> anyhow::Result<()>;
    async fn list_routes(&self, table: u32) -> anyhow::Result<Vec<AgentRoute>>;
    async fn add_route(&self, route: &AgentRoute) -> anyhow::Result<()>;
    async fn delete_route(&self, route: &AgentRoute) -> anyhow::Result<()>;
}

/// HTTP/JSON client for the agent: one POST per call, strictly request/response.
pub struct HttpAgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build an HTTP client")?;
        Ok(HttpAgentClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn call<Req: Serialize + Sync, Resp: DeserializeOwned>(
        &self,
        method: &str,
        request: &Req,
    ) -> anyhow::Result<Resp> {
        let url = format!("{}/rpc/v1/NetworkService/{}", self.base_url, method);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("agent call {method} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let failure: CallFailure = response.json().await.unwrap_or_default();
            anyhow::bail!(
                "agent call {method} returned {status}: {} (exit code {}, output: {})",
                failure.message,
                failure.exit_code,
                failure.output
            );
        }
        response
            .json()
            .await
            .with_context(|| format!("agent call {method} returned an unexpected body"))
    }
}

/// Error payload of a failed `ip(8)` invocation on the agent side.
#[derive(Debug, Default, Deserialize)]
struct CallFailure {
    #[serde(default)]
    message: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    output: String,
}

#[derive(Serialize)]
struct RuleRequest<'a> {
    rule: &'a RuleConfig,
}

#[derive(Deserialize, Default)]
struct HasRuleResponse {
    #[serde(default)]
    exists: bool,
}

#[derive(Serialize)]
struct ListRoutesRequest {
    table: u32,
}

#[derive(Deserialize, Default)]
struct ListRoutesResponse {
    #[serde(default)]
    routes: Vec<AgentRoute>,
}

#[derive(Serialize)]
struct RouteRequest<'a> {
    route: &'a AgentRoute,
}

#[derive(Deserialize, Default)]
struct EmptyResponse {}

#[async_trait]
impl NetworkAgent for HttpAgentClient {
    async fn has_rule(&self, rule: &RuleConfig) -> anyhow::Result<bool> {
        let resp: HasRuleResponse = self.call("HasRule", &RuleRequest { rule }).await?;
        Ok(resp.exists)
    }

    async fn add_rule(&self, rule: &RuleConfig) -> anyhow::Result<()> {
        let _: EmptyResponse = self.call("AddRule", &RuleRequest { rule }).await?;
        Ok(())
    }

    async fn list_routes(&self, table: u32) -> anyhow::Result<Vec<AgentRoute>> {
        let resp: ListRoutesResponse = self.call("ListRoutes", &ListRoutesRequest { table }).await?;
        Ok(resp.routes)
    }

    async fn add_route(&self, route: &AgentRoute) -> anyhow::Result<()> {
        let _: EmptyResponse = self.call("AddRoute", &RouteRequest { route }).await?;
        Ok(())
    }

    async fn delete_route(&self, route: &AgentRoute) -> anyhow::Result<()> {
        let _: EmptyResponse = self.call("DeleteRoute", &RouteRequest { route }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    type CallLog = Arc<Mutex<Vec<(String, Value)>>>;

    async fn handle(State(log): State<CallLog>, Path(method): Path<String>, Json(body): Json<Value>) -> axum::response::Response {
        log.lock().unwrap().push((method.clone(), body));
        match method.as_str() {
            "HasRule" => Json(json!({"exists": true})).into_response(),
            "ListRoutes" => Json(json!({
                "routes": [
                    {"table": 1000, "iface": "wg0", "address": "10.0.0.1"},
                    {"table": 1000, "iface": "wg0", "address": "203.0.113.0/24"},
                ]
            }))
            .into_response(),
            "DeleteRoute" => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "message": "ip route del failed",
                    "exit_code": 2,
                    "output": "RTNETLINK answers: No such process",
                })),
            )
                .into_response(),
            _ => Json(json!({})).into_response(),
        }
    }

    async fn fake_agent() -> (SocketAddr, CallLog) {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route("/rpc/v1/NetworkService/:method", post(handle))
            .with_state(log.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, log)
    }

    fn rule() -> RuleConfig {
        RuleConfig {
            table: 1000,
            iif: "br0".to_string(),
            priority: 2000,
        }
    }

    #[tokio::test]
    async fn requests_and_responses_are_json_framed() {
        let (addr, log) = fake_agent().await;
        let client = HttpAgentClient::new(format!("http://{addr}/"), Duration::from_secs(2)).unwrap();

        assert!(client.has_rule(&rule()).await.unwrap());
        client.add_rule(&rule()).await.unwrap();

        let routes = client.list_routes(1000).await.unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].address, "10.0.0.1");

        let route = AgentRoute {
            table: 1000,
            iface: "wg0".to_string(),
            address: "10.0.0.9".to_string(),
        };
        client.add_route(&route).await.unwrap();

        let calls = log.lock().unwrap().clone();
        let methods: Vec<&str> = calls.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(methods, ["HasRule", "AddRule", "ListRoutes", "AddRoute"]);
        assert_eq!(calls[0].1, json!({"rule": {"table": 1000, "iif": "br0", "priority": 2000}}));
        assert_eq!(calls[2].1, json!({"table": 1000}));
        assert_eq!(
            calls[3].1,
            json!({"route": {"table": 1000, "iface": "wg0", "address": "10.0.0.9"}})
        );
    }

    #[tokio::test]
    async fn command_failures_carry_exit_code_and_output() {
        let (addr, _log) = fake_agent().await;
        let client = HttpAgentClient::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();

        let route = AgentRoute {
            table: 1000,
            iface: "wg0".to_string(),
            address: "10.0.0.9".to_string(),
        };
        let err = client.delete_route(&route).await.unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("DeleteRoute"), "unexpected error: {text}");
        assert!(text.contains("exit code 2"), "unexpected error: {text}");
        assert!(text.contains("No such process"), "unexpected error: {text}");
    }

    #[tokio::test]
    async fn unreachable_agent_is_an_error_not_a_panic() {
        // A port from the ephemeral range with nothing listening.
        let client = HttpAgentClient::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        assert!(client.has_rule(&rule()).await.is_err());
    }
}
