use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ServerId, SessionId};
use crate::transport::BackendKind;

/// Direct model providers reachable through the provider-stream adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenAi,
    Anthropic,
    Google,
    Xai,
    OpenRouter,
    DeepSeek,
    Groq,
    Together,
    Mistral,
    Perplexity,
    Kimi,
    MiniMax,
    Glm,
    Custom,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Xai => "xai",
            Self::OpenRouter => "openrouter",
            Self::DeepSeek => "deepseek",
            Self::Groq => "groq",
            Self::Together => "together",
            Self::Mistral => "mistral",
            Self::Perplexity => "perplexity",
            Self::Kimi => "kimi",
            Self::MiniMax => "minimax",
            Self::Glm => "glm",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
            .map_err(|_| format!("unknown provider type: {s}"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_type: ProviderType,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub reasoning_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl ProviderConfig {
    pub fn new(provider_type: ProviderType, model_id: impl Into<String>) -> Self {
        Self {
            provider_type,
            model_id: model_id.into(),
            base_url: None,
            system_prompt: None,
            temperature: None,
            reasoning_enabled: false,
            reasoning_effort: None,
        }
    }

    /// Key under which the credential port stores this provider's API key.
    pub fn credential_key(&self, server_id: &ServerId) -> String {
        format!("{}_{}", server_id, self.provider_type)
    }
}

/// Which transport a conversation is bound to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backend {
    RemoteAgent { remote_session_id: String },
    Provider(ProviderConfig),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::RemoteAgent { .. } => BackendKind::RemoteAgent,
            Self::Provider(_) => BackendKind::Provider,
        }
    }
}

/// Persisted conversation metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub server_id: ServerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub backend: Backend,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(server_id: ServerId, backend: Backend) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            server_id,
            title: None,
            backend,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerKind {
    /// Remote agent speaking JSON-RPC over WebSocket.
    Acp { url: String },
    AiProvider(ProviderConfig),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: ServerId,
    pub name: String,
    pub kind: ServerKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_type_wire_names() {
        assert_eq!(serde_json::to_string(&ProviderType::OpenAi).unwrap(), r#""openai""#);
        assert_eq!(serde_json::to_string(&ProviderType::OpenRouter).unwrap(), r#""openrouter""#);
        assert_eq!("DeepSeek".parse::<ProviderType>().unwrap(), ProviderType::DeepSeek);
        assert!("nope".parse::<ProviderType>().is_err());
    }

    #[test]
    fn as_str_matches_serde() {
        let providers = [
            ProviderType::Xai,
            ProviderType::MiniMax,
            ProviderType::Glm,
            ProviderType::Custom,
        ];
        for p in providers {
            let json = serde_json::to_value(p).unwrap();
            assert_eq!(json, p.as_str());
        }
    }

    #[test]
    fn credential_key_combines_server_and_provider() {
        let cfg = ProviderConfig::new(ProviderType::Anthropic, "claude-sonnet-4");
        assert_eq!(
            cfg.credential_key(&ServerId::from_raw("srv_a")),
            "srv_a_anthropic"
        );
    }

    #[test]
    fn backend_serde_and_kind() {
        let remote = Backend::RemoteAgent {
            remote_session_id: "abc".into(),
        };
        let json = serde_json::to_value(&remote).unwrap();
        assert_eq!(json["type"], "remote_agent");
        assert_eq!(remote.kind(), BackendKind::RemoteAgent);

        let provider = Backend::Provider(ProviderConfig::new(ProviderType::OpenAi, "gpt-4o"));
        let json = serde_json::to_value(&provider).unwrap();
        assert_eq!(json["type"], "provider");
        assert_eq!(json["model_id"], "gpt-4o");
        let parsed: Backend = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, provider);
        assert_eq!(parsed.kind(), BackendKind::Provider);
    }

    #[test]
    fn server_kind_serde() {
        let server = ServerConfig {
            id: ServerId::from_raw("srv_1"),
            name: "Local agent".into(),
            kind: ServerKind::Acp {
                url: "ws://127.0.0.1:8765".into(),
            },
        };
        let json = serde_json::to_value(&server).unwrap();
        assert_eq!(json["kind"]["type"], "acp");
        let parsed: ServerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, server);
    }
}
