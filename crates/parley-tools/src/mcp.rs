//! MCP tool provider over the streamable HTTP transport.
//!
//! Every request is a JSON-RPC envelope POSTed to the server endpoint. The
//! server answers with either a JSON body or a short SSE stream carrying the
//! response envelope. The `Mcp-Session-Id` header handed out at initialize is
//! echoed on every later request.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use parley_core::{RemoteResource, RemoteTool, ToolError, ToolProvider};
use parley_rpc::{classify, Envelope, RequestId};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
pub const PROTOCOL_VERSION: &str = "2025-03-26";
const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

#[derive(Clone, Debug, Default)]
pub enum McpAuth {
    #[default]
    None,
    Bearer(SecretString),
    ApiKey {
        key: SecretString,
        /// Defaults to `X-API-Key`.
        header_name: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct McpServerConfig {
    pub id: String,
    pub name: String,
    /// Full endpoint URL, e.g. `https://host/mcp`.
    pub url: String,
    pub auth: McpAuth,
}

pub struct HttpMcpProvider {
    config: McpServerConfig,
    http: reqwest::Client,
    client_name: String,
    client_version: String,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl HttpMcpProvider {
    pub fn new(config: McpServerConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            client_name: "parley".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_name = name.into();
        self.client_version = version.into();
        self
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(&self.config.url)
            .header("accept", "application/json, text/event-stream")
            .json(body);

        match &self.config.auth {
            McpAuth::None => {}
            McpAuth::Bearer(token) => req = req.bearer_auth(token.expose_secret()),
            McpAuth::ApiKey { key, header_name } => {
                let name = header_name.as_deref().unwrap_or(DEFAULT_API_KEY_HEADER);
                req = req.header(name, key.expose_secret());
            }
        }
        if let Some(session) = self.session_id() {
            req = req.header(SESSION_HEADER, session);
        }
        req
    }

    /// Send a request and return its `result`.
    async fn request(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::request(id, method, Some(params));
        debug!(server = %self.config.id, method, id, "mcp request");

        let resp = self
            .post(&envelope.to_value())
            .send()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        let status = resp.status();
        if let Some(session) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }
        let is_sse = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = resp
            .text()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        if status.as_u16() == 404 && self.session_id().is_some() {
            *self.session_id.lock() = None;
            return Err(ToolError::ProviderUnavailable(format!(
                "{}: session expired",
                self.config.id
            )));
        }
        if !status.is_success() {
            return Err(ToolError::Transport(format!("HTTP {}: {body}", status.as_u16())));
        }

        let expected = RequestId::from(id);
        let envelope = if is_sse {
            response_from_sse(&body, &expected)?
        } else {
            let value: Value =
                serde_json::from_str(&body).map_err(|e| ToolError::Transport(e.to_string()))?;
            classify(&value).map_err(|e| ToolError::Transport(e.to_string()))?
        };

        match envelope {
            Envelope::Response { id, outcome } if id == expected => outcome.map_err(|e| {
                ToolError::Execution(format!("{method} failed ({}): {}", e.code, e.message))
            }),
            other => Err(ToolError::Transport(format!(
                "unexpected reply to {method}: {:?}",
                other.method()
            ))),
        }
    }

    async fn notify(&self, method: &str) -> Result<(), ToolError> {
        let envelope = Envelope::notification(method, None);
        let resp = self
            .post(&envelope.to_value())
            .send()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ToolError::Transport(format!(
                "HTTP {} for {method}",
                resp.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Pick the response envelope for `expected` out of an SSE body. Server
/// notifications interleaved before it are skipped.
fn response_from_sse(body: &str, expected: &RequestId) -> Result<Envelope, ToolError> {
    body.lines()
        .filter_map(|line| {
            let data = line.trim().strip_prefix("data:")?.trim();
            serde_json::from_str::<Value>(data).ok()
        })
        .filter_map(|value| classify(&value).ok())
        .find(|env| matches!(env, Envelope::Response { id, .. } if id == expected))
        .ok_or_else(|| ToolError::Transport("event stream ended without a response".into()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResource {
    uri: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

fn parse_list<T: serde::de::DeserializeOwned>(
    result: &Value,
    key: &str,
) -> Result<Vec<T>, ToolError> {
    match result.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(items) => serde_json::from_value(items.clone())
            .map_err(|e| ToolError::Transport(format!("malformed {key}: {e}"))),
    }
}

/// Join the text parts of a `tools/call` result; fall back to the raw
/// content JSON when there are none.
fn tool_result_text(result: &Value) -> String {
    let content = result.get("content").cloned().unwrap_or(Value::Null);
    let text: Vec<&str> = content
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() {
        content.to_string()
    } else {
        text.join("\n")
    }
}

#[async_trait]
impl ToolProvider for HttpMcpProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self), fields(server = %self.config.id))]
    async fn connect(&self) -> Result<(), ToolError> {
        *self.session_id.lock() = None;
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": self.client_name, "version": self.client_version},
                }),
            )
            .await?;
        self.notify("notifications/initialized").await?;

        info!(
            server_name = result["serverInfo"]["name"].as_str().unwrap_or("unknown"),
            session = self.session_id().is_some(),
            "mcp server initialized"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(session) = self.session_id.lock().take() else {
            return;
        };
        let resp = self
            .http
            .delete(&self.config.url)
            .header(SESSION_HEADER, session)
            .send()
            .await;
        if let Err(e) = resp {
            warn!(server = %self.config.id, error = %e, "mcp session close failed");
        }
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, ToolError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools: Vec<WireTool> = parse_list(&result, "tools")?;
        Ok(tools
            .into_iter()
            .map(|t| RemoteTool {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema.unwrap_or_else(|| json!({"type": "object"})),
            })
            .collect())
    }

    async fn list_resources(&self) -> Result<Vec<RemoteResource>, ToolError> {
        let result = self.request("resources/list", json!({})).await?;
        let resources: Vec<WireResource> = parse_list(&result, "resources")?;
        Ok(resources
            .into_iter()
            .map(|r| RemoteResource {
                uri: r.uri,
                name: r.name,
                description: r.description,
                mime_type: r.mime_type,
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<String, ToolError> {
        let arguments = if args.is_object() { args } else { json!({}) };
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        let text = tool_result_text(&result);
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(ToolError::Execution(text));
        }
        Ok(text)
    }

    async fn read_resource(&self, uri: &str) -> Result<String, ToolError> {
        let result = self.request("resources/read", json!({"uri": uri})).await?;
        let parts: Vec<&str> = result
            .get("contents")
            .and_then(Value::as_array)
            .map(|c| c.iter().filter_map(|p| p.get("text").and_then(Value::as_str)).collect())
            .unwrap_or_default();
        Ok(parts.join("\n"))
    }
}
