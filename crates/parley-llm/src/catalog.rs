//! Provider catalogue: wire family, default endpoints and reasoning options
//! for every supported provider type.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::{json, Map, Value};

use parley_core::{ProviderConfig, ProviderType, ReasoningEffort};

use crate::anthropic::AnthropicClient;
use crate::client::{ModelClient, ReasoningOptions};
use crate::error::ProviderError;
use crate::openai::OpenAiCompatClient;

/// Wire protocol spoken by a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderFamily {
    /// Chat Completions with SSE chunks.
    OpenAiCompatible,
    /// Messages API with typed SSE events.
    Anthropic,
}

pub fn family(provider: ProviderType) -> ProviderFamily {
    match provider {
        ProviderType::Anthropic => ProviderFamily::Anthropic,
        _ => ProviderFamily::OpenAiCompatible,
    }
}

pub fn default_base_url(provider: ProviderType) -> Option<&'static str> {
    Some(match provider {
        ProviderType::OpenAi => "https://api.openai.com/v1",
        ProviderType::Anthropic => "https://api.anthropic.com/v1",
        ProviderType::Google => "https://generativelanguage.googleapis.com/v1beta/openai",
        ProviderType::Xai => "https://api.x.ai/v1",
        ProviderType::OpenRouter => "https://openrouter.ai/api/v1",
        ProviderType::DeepSeek => "https://api.deepseek.com/v1",
        ProviderType::Groq => "https://api.groq.com/openai/v1",
        ProviderType::Together => "https://api.together.xyz/v1",
        ProviderType::Mistral => "https://api.mistral.ai/v1",
        ProviderType::Perplexity => "https://api.perplexity.ai",
        ProviderType::Kimi => "https://api.moonshot.ai/v1",
        ProviderType::MiniMax => "https://api.minimax.io/v1",
        ProviderType::Glm => "https://open.bigmodel.cn/api/paas/v4",
        ProviderType::Custom => return None,
    })
}

/// Resolve the endpoint root: explicit override first, then the default.
pub fn base_url(config: &ProviderConfig) -> Result<String, ProviderError> {
    config
        .base_url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .or_else(|| default_base_url(config.provider_type))
        .map(|u| u.trim_end_matches('/').to_string())
        .ok_or_else(|| {
            ProviderError::Config(format!(
                "base URL is required for provider \"{}\"",
                config.provider_type
            ))
        })
}

/// Extra Chat Completions body fields that enable reasoning.
/// Anthropic thinking is handled by its own client.
pub fn reasoning_fields(provider: ProviderType, options: &ReasoningOptions) -> Map<String, Value> {
    let mut fields = Map::new();
    match provider {
        ProviderType::OpenAi
        | ProviderType::DeepSeek
        | ProviderType::Groq
        | ProviderType::Together
        | ProviderType::Mistral => {
            if let Some(effort) = options.effort {
                fields.insert("reasoning_effort".into(), json!(effort.as_str()));
            }
        }
        ProviderType::Xai => {
            let effort = options.effort.unwrap_or(ReasoningEffort::High);
            fields.insert("reasoning_effort".into(), json!(effort.as_str()));
        }
        ProviderType::Google => {
            fields.insert(
                "extra_body".into(),
                json!({"google": {"thinking_config": {"include_thoughts": true}}}),
            );
        }
        _ => {}
    }
    fields
}

/// HTTP knobs shared by every client.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub anthropic_max_tokens: u32,
    pub anthropic_thinking_budget: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            anthropic_max_tokens: 16_384,
            anthropic_thinking_budget: 10_000,
        }
    }
}

/// Build the streaming client for `config`.
pub fn build_client(
    config: &ProviderConfig,
    api_key: SecretString,
    options: &ClientOptions,
) -> Result<Arc<dyn ModelClient>, ProviderError> {
    let base = base_url(config)?;
    let http = reqwest::Client::builder()
        .connect_timeout(options.connect_timeout)
        .build()?;

    Ok(match family(config.provider_type) {
        ProviderFamily::Anthropic => Arc::new(AnthropicClient::new(http, base, api_key, options)),
        ProviderFamily::OpenAiCompatible => Arc::new(OpenAiCompatClient::new(
            http,
            config.provider_type,
            base,
            api_key,
            options.idle_timeout,
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_provider_but_custom_has_a_default() {
        assert!(default_base_url(ProviderType::Custom).is_none());
        for p in [
            ProviderType::OpenAi,
            ProviderType::Anthropic,
            ProviderType::Google,
            ProviderType::Xai,
            ProviderType::OpenRouter,
            ProviderType::DeepSeek,
            ProviderType::Groq,
            ProviderType::Together,
            ProviderType::Mistral,
            ProviderType::Perplexity,
            ProviderType::Kimi,
            ProviderType::MiniMax,
            ProviderType::Glm,
        ] {
            assert!(default_base_url(p).is_some(), "{p}");
        }
    }

    #[test]
    fn base_url_override_and_trailing_slash() {
        let mut cfg = ProviderConfig::new(ProviderType::OpenAi, "gpt-4o");
        assert_eq!(base_url(&cfg).unwrap(), "https://api.openai.com/v1");
        cfg.base_url = Some("http://localhost:11434/v1/".into());
        assert_eq!(base_url(&cfg).unwrap(), "http://localhost:11434/v1");
    }

    #[test]
    fn custom_without_base_url_is_config_error() {
        let cfg = ProviderConfig::new(ProviderType::Custom, "local");
        let err = base_url(&cfg).unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
        assert!(build_client(&cfg, SecretString::from("k"), &ClientOptions::default()).is_err());
    }

    #[test]
    fn family_mapping() {
        assert_eq!(family(ProviderType::Anthropic), ProviderFamily::Anthropic);
        assert_eq!(family(ProviderType::Groq), ProviderFamily::OpenAiCompatible);
    }

    #[test]
    fn reasoning_fields_per_provider() {
        let none = ReasoningOptions { effort: None };
        let low = ReasoningOptions {
            effort: Some(ReasoningEffort::Low),
        };

        assert!(reasoning_fields(ProviderType::OpenAi, &none).is_empty());
        assert_eq!(reasoning_fields(ProviderType::OpenAi, &low)["reasoning_effort"], "low");
        assert_eq!(reasoning_fields(ProviderType::Xai, &none)["reasoning_effort"], "high");
        assert_eq!(reasoning_fields(ProviderType::Groq, &low)["reasoning_effort"], "low");
        assert!(reasoning_fields(ProviderType::Google, &none).contains_key("extra_body"));
        assert!(reasoning_fields(ProviderType::Perplexity, &low).is_empty());
    }
}
