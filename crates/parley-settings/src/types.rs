//! Settings sections. Field names are camelCase on disk; every section is
//! `#[serde(default)]` so partial files are accepted.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub provider: ProviderSettings,
    pub rpc: RpcSettings,
    pub tools: ToolSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// SQLite database holding servers, sessions and transcripts.
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: crate::loader::parley_dir().join("parley.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module overrides, e.g. `{"parley_rpc": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// Upper bound on model round-trips per prompt when tools are in play.
    pub max_steps: u32,
    pub connect_timeout_ms: u64,
    /// Abort a stream that produces no bytes for this long.
    pub idle_timeout_ms: u64,
    pub anthropic_max_tokens: u32,
    pub anthropic_thinking_budget: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            max_steps: 10,
            connect_timeout_ms: 30_000,
            idle_timeout_ms: 120_000,
            anthropic_max_tokens: 16_384,
            anthropic_thinking_budget: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcSettings {
    pub request_timeout_ms: u64,
    pub client_name: String,
    pub client_version: String,
    /// Working directory announced on `session/new`.
    pub cwd: Option<String>,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 300_000,
            client_name: "parley".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            cwd: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSettings {
    pub discovery_attempts: u32,
    pub discovery_backoff_ms: u64,
    pub mcp_servers: Vec<McpServerSettings>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            discovery_attempts: 3,
            discovery_backoff_ms: 500,
            mcp_servers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerSettings {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<McpAuthSettings>,
}

fn enabled_default() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum McpAuthSettings {
    Bearer {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    ApiKey {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header_name: Option<String>,
    },
}
