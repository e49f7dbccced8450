//! JSON-RPC 2.0 over HTTP, as spoken by plugin servers.
//!
//! Only what the sandbox needs: liveness (`ping`), the `initialize`
//! handshake and `tools/list`. Servers may answer with a plain JSON body or
//! with an SSE stream carrying the response.

pub mod sse;

use crate::{Result, SandholdError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";

/// A tool as the plugin describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<RemoteTool>,
    #[serde(rename = "nextCursor", default)]
    next_cursor: Option<String>,
}

#[async_trait]
pub trait PluginClient: Send + Sync {
    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;

    async fn initialize(&self) -> Result<()>;

    async fn list_tools(&self) -> Result<Vec<RemoteTool>>;

    /// End the session. Never fails; the container may already be gone.
    async fn close(&self);
}

/// Makes a client once a plugin's published endpoint is known.
pub trait PluginClientFactory: Send + Sync {
    fn client_for(&self, plugin_id: &str, endpoint: &str) -> Arc<dyn PluginClient>;
}

pub struct HttpPluginClient {
    plugin_id: String,
    endpoint: String,
    http: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
    session_id: Mutex<Option<String>>,
}

impl HttpPluginClient {
    pub fn new(plugin_id: &str, endpoint: &str, http: reqwest::Client, timeout: Duration) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            endpoint: endpoint.to_string(),
            http,
            timeout,
            next_id: AtomicU64::new(1),
            session_id: Mutex::new(None),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn capture_session_id(&self, headers: &HeaderMap) {
        if let Some(value) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            tracing::debug!(plugin_id = %self.plugin_id, session_id = value, "captured session id");
            *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(value.to_string());
        }
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_HEADER, session_id);
        }
        request
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut body = json!({"jsonrpc": "2.0", "id": id, "method": method});
        if let Some(params) = params {
            body["params"] = params;
        }

        let response = self.post(&body).send().await?;
        self.capture_session_id(response.headers());

        let status = response.status();
        if !status.is_success() {
            return Err(SandholdError::Protocol(format!(
                "{} returned HTTP {}",
                method, status
            )));
        }

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let text = response.text().await?;

        let reply = if is_sse {
            find_sse_response(&text, id)?
        } else {
            serde_json::from_str::<RpcResponse>(&text)?
        };

        if let Some(error) = reply.error {
            return Err(SandholdError::Protocol(format!(
                "{} failed ({}): {}",
                method, error.code, error.message
            )));
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let body = json!({"jsonrpc": "2.0", "method": method});
        let response = self.post(&body).send().await?;
        if !response.status().is_success() {
            return Err(SandholdError::Protocol(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Pick the response to request `id` out of an SSE body.
fn find_sse_response(body: &str, id: u64) -> Result<RpcResponse> {
    sse::parse_sse_events(body)
        .into_iter()
        .filter_map(|event| serde_json::from_str::<RpcResponse>(&event.data).ok())
        .find(|reply| reply.id.as_ref().and_then(Value::as_u64) == Some(id))
        .ok_or_else(|| {
            SandholdError::Protocol(format!("no response for request {} in event stream", id))
        })
}

#[async_trait]
impl PluginClient for HttpPluginClient {
    async fn ping(&self) -> Result<()> {
        self.call("ping", None).await.map(|_| ())
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "sandhold", "version": env!("CARGO_PKG_VERSION")},
        });
        let result = self.call("initialize", Some(params)).await?;
        let server = result.get("serverInfo").cloned().unwrap_or_default();
        tracing::debug!(plugin_id = %self.plugin_id, %server, "plugin initialized");
        self.notify("notifications/initialized").await
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({"cursor": c}));
            let page: ToolsPage = serde_json::from_value(self.call("tools/list", params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn close(&self) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        let result = self
            .http
            .delete(&self.endpoint)
            .timeout(self.timeout)
            .header(SESSION_HEADER, session_id)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(plugin_id = %self.plugin_id, "session close failed: {}", e);
        }
    }
}

/// Builds [`HttpPluginClient`]s sharing one connection pool.
#[derive(Clone)]
pub struct HttpClientFactory {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

impl PluginClientFactory for HttpClientFactory {
    fn client_for(&self, plugin_id: &str, endpoint: &str) -> Arc<dyn PluginClient> {
        Arc::new(HttpPluginClient::new(
            plugin_id,
            endpoint,
            self.http.clone(),
            self.timeout,
        ))
    }
}
