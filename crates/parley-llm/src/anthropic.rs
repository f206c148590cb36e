//! Anthropic Messages API streaming client.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use parley_core::ProviderType;

use crate::catalog::ClientOptions;
use crate::client::{
    ChatTurn, FinishReason, ModelClient, ModelEvent, ModelRequest, ModelStream, ModelToolCall,
};
use crate::error::ProviderError;
use crate::sse;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    max_tokens: u32,
    thinking_budget: u32,
    idle_timeout: Duration,
}

impl AnthropicClient {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        api_key: SecretString,
        options: &ClientOptions,
    ) -> Self {
        Self {
            http,
            base_url,
            api_key,
            max_tokens: options.anthropic_max_tokens,
            thinking_budget: options.anthropic_thinking_budget,
            idle_timeout: options.idle_timeout,
        }
    }

    fn build_body(&self, request: &ModelRequest) -> Value {
        let thinking = request.reasoning.is_some();
        let max_tokens = if thinking {
            self.max_tokens.max(self.thinking_budget + 4096)
        } else {
            self.max_tokens
        };

        let mut body = json!({
            "model": request.model,
            "max_tokens": max_tokens,
            "stream": true,
            "messages": convert_turns(&request.turns),
        });
        if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
        }
        if thinking {
            // Extended thinking rejects a custom temperature.
            body["thinking"] = json!({"type": "enabled", "budget_tokens": self.thinking_budget});
        } else if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn provider(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    #[instrument(skip_all, fields(provider = "anthropic", model = %request.model))]
    async fn stream(&self, request: &ModelRequest) -> Result<ModelStream, ProviderError> {
        let body = self.build_body(request);
        let resp = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }
        debug!("messages stream opened");

        let mut lines = Box::pin(sse::data_lines(resp.bytes_stream(), self.idle_timeout));
        let stream = async_stream::stream! {
            let mut parser = EventParser::default();
            while let Some(line) = lines.next().await {
                match line.and_then(|data| parser.push(&data)) {
                    Ok(events) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            if let Err(e) = parser.finish() {
                yield Err(e);
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Convert turns into Messages API messages. Consecutive tool results share
/// one user message.
fn convert_turns(turns: &[ChatTurn]) -> Vec<Value> {
    let mut messages: Vec<Value> = Vec::with_capacity(turns.len());
    let mut results_open = false;

    for turn in turns {
        match turn {
            ChatTurn::User { text, images } => {
                let mut content = Vec::with_capacity(images.len() + 1);
                content.extend(images.iter().map(|img| {
                    json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": img.mime_type, "data": img.data},
                    })
                }));
                content.push(json!({"type": "text", "text": text}));
                messages.push(json!({"role": "user", "content": content}));
                results_open = false;
            }
            ChatTurn::Assistant { text, tool_calls } => {
                let mut content = Vec::new();
                if !text.is_empty() {
                    content.push(json!({"type": "text", "text": text}));
                }
                for call in tool_calls {
                    let input: Value =
                        serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                    content.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": input,
                    }));
                }
                messages.push(json!({"role": "assistant", "content": content}));
                results_open = false;
            }
            ChatTurn::ToolResult {
                call_id, content, ..
            } => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": content,
                });
                match messages.last_mut().and_then(|m| m["content"].as_array_mut()) {
                    Some(blocks) if results_open => blocks.push(block),
                    _ => {
                        messages.push(json!({"role": "user", "content": [block]}));
                        results_open = true;
                    }
                }
            }
        }
    }
    messages
}

struct OpenToolUse {
    id: String,
    name: String,
    input_json: String,
}

/// State machine over Messages API stream events.
#[derive(Default)]
pub struct EventParser {
    tool: Option<OpenToolUse>,
    stop_reason: Option<String>,
    finished: bool,
}

impl EventParser {
    pub fn push(&mut self, data: &str) -> Result<Vec<ModelEvent>, ProviderError> {
        let event: Value =
            serde_json::from_str(data).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let mut events = Vec::new();

        match event.get("type").and_then(Value::as_str) {
            Some("content_block_start") => {
                let block = &event["content_block"];
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    self.tool = Some(OpenToolUse {
                        id: str_field(block, "id"),
                        name: str_field(block, "name"),
                        input_json: String::new(),
                    });
                }
            }
            Some("content_block_delta") => {
                let delta = &event["delta"];
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = str_field(delta, "text");
                        if !text.is_empty() {
                            events.push(ModelEvent::TextDelta(text));
                        }
                    }
                    Some("thinking_delta") => {
                        let text = str_field(delta, "thinking");
                        if !text.is_empty() {
                            events.push(ModelEvent::ReasoningDelta(text));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(tool) = self.tool.as_mut() {
                            tool.input_json.push_str(&str_field(delta, "partial_json"));
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                if let Some(tool) = self.tool.take() {
                    let arguments = if tool.input_json.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        tool.input_json
                    };
                    events.push(ModelEvent::ToolCall(ModelToolCall {
                        id: tool.id,
                        name: tool.name,
                        arguments,
                    }));
                }
            }
            Some("message_delta") => {
                if let Some(reason) = event["delta"].get("stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                }
            }
            Some("message_stop") => {
                self.finished = true;
                let reason = self.stop_reason.as_deref().unwrap_or("end_turn");
                events.push(ModelEvent::Finish(FinishReason::parse(reason)));
            }
            Some("error") => {
                let err = &event["error"];
                if err.get("type").and_then(Value::as_str) == Some("overloaded_error") {
                    return Err(ProviderError::Overloaded);
                }
                return Err(ProviderError::Remote(str_field(err, "message")));
            }
            _ => {} // message_start, ping
        }
        Ok(events)
    }

    pub fn finish(&self) -> Result<(), ProviderError> {
        if self.finished {
            Ok(())
        } else {
            Err(ProviderError::StreamInterrupted(
                "stream ended before message_stop".into(),
            ))
        }
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
