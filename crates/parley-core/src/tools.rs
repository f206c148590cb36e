use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ToolError;

/// Joins a provider id and a tool name into a collision-free identifier.
/// The aggregator only accepts provider ids within `[A-Za-z0-9_-]`, so the
/// prefix never breaks a model function name.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Tool as reported by its provider during discovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResource {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Aggregated, namespaced view of one tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// `<provider_id>__<tool_name>`.
    pub name: String,
    pub tool_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub provider_id: String,
}

impl ToolDescriptor {
    pub fn from_remote(provider_id: &str, tool: RemoteTool) -> Self {
        Self {
            name: namespaced(provider_id, &tool.name),
            description: tool.description.unwrap_or_else(|| tool.name.clone()),
            tool_name: tool.name,
            input_schema: tool.input_schema,
            provider_id: provider_id.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub provider_id: String,
}

impl ResourceDescriptor {
    pub fn from_remote(provider_id: &str, resource: RemoteResource) -> Self {
        Self {
            uri: resource.uri,
            name: resource.name,
            description: resource.description,
            mime_type: resource.mime_type,
            provider_id: provider_id.to_string(),
        }
    }
}

pub fn namespaced(provider_id: &str, tool_name: &str) -> String {
    format!("{provider_id}{NAMESPACE_SEPARATOR}{tool_name}")
}

/// One independent tool-provider connection.
///
/// Errors from a single provider never become engine-fatal; the aggregator
/// logs them and degrades capability.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), ToolError>;
    async fn disconnect(&self);

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, ToolError>;
    async fn list_resources(&self) -> Result<Vec<RemoteResource>, ToolError>;

    /// `name` is the provider's own (bare) tool name.
    async fn call_tool(&self, name: &str, args: serde_json::Value) -> Result<String, ToolError>;
    async fn read_resource(&self, uri: &str) -> Result<String, ToolError>;
}

/// What a transport adapter sees of the tool layer.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    fn tools(&self) -> Vec<ToolDescriptor>;

    async fn invoke(&self, name: &str, args: serde_json::Value) -> Result<String, ToolError>;

    /// Invoke and fold any failure into the textual result the model sees.
    async fn invoke_to_text(&self, name: &str, args: serde_json::Value) -> String {
        match self.invoke(name, args).await {
            Ok(text) => text,
            Err(e) => format!("Error: {e}"),
        }
    }
}

/// Invoker with nothing registered.
pub struct NoTools;

#[async_trait]
impl ToolInvoker for NoTools {
    fn tools(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }

    async fn invoke(&self, name: &str, _args: serde_json::Value) -> Result<String, ToolError> {
        Err(ToolError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_is_namespaced() {
        let desc = ToolDescriptor::from_remote(
            "github",
            RemoteTool {
                name: "search".into(),
                description: None,
                input_schema: serde_json::json!({"type": "object"}),
            },
        );
        assert_eq!(desc.name, "github__search");
        assert_eq!(desc.tool_name, "search");
        assert_eq!(desc.description, "search");
        assert_eq!(desc.provider_id, "github");
    }

    #[test]
    fn remote_tool_defaults_schema() {
        let tool: RemoteTool = serde_json::from_value(serde_json::json!({"name": "x"})).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[tokio::test]
    async fn no_tools_reports_not_found_as_text() {
        let invoker = NoTools;
        assert!(invoker.tools().is_empty());
        let text = invoker.invoke_to_text("x", serde_json::json!({})).await;
        assert_eq!(text, "Error: tool not found: x");
    }
}
