//! Chat Completions streaming client, used for OpenAI and every
//! OpenAI-compatible provider.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use parley_core::ProviderType;

use crate::catalog;
use crate::client::{
    ChatTurn, FinishReason, ModelClient, ModelEvent, ModelRequest, ModelStream, ModelToolCall,
};
use crate::error::ProviderError;
use crate::sse;

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    provider: ProviderType,
    base_url: String,
    api_key: SecretString,
    idle_timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(
        http: reqwest::Client,
        provider: ProviderType,
        base_url: String,
        api_key: SecretString,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            http,
            provider,
            base_url,
            api_key,
            idle_timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    fn provider(&self) -> ProviderType {
        self.provider
    }

    #[instrument(skip_all, fields(provider = %self.provider, model = %request.model))]
    async fn stream(&self, request: &ModelRequest) -> Result<ModelStream, ProviderError> {
        let body = build_body(self.provider, request);
        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(self.api_key.expose_secret())
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }
        debug!("chat completions stream opened");

        let mut lines = Box::pin(sse::data_lines(resp.bytes_stream(), self.idle_timeout));
        let stream = async_stream::stream! {
            let mut parser = ChunkParser::default();
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
            for event in parser.finish() {
                yield Ok(event);
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Request body for a streaming Chat Completions call.
pub fn build_body(provider: ProviderType, request: &ModelRequest) -> Value {
    let mut messages = Vec::with_capacity(request.turns.len() + 1);
    if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.extend(request.turns.iter().map(turn_to_message));

    let mut body = json!({
        "model": request.model,
        "stream": true,
        "messages": messages,
    });

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let (Some(reasoning), Some(obj)) = (&request.reasoning, body.as_object_mut()) {
        obj.extend(catalog::reasoning_fields(provider, reasoning));
    }
    body
}

fn turn_to_message(turn: &ChatTurn) -> Value {
    match turn {
        ChatTurn::User { text, images } if images.is_empty() => {
            json!({"role": "user", "content": text})
        }
        ChatTurn::User { text, images } => {
            let mut parts = vec![json!({"type": "text", "text": text})];
            parts.extend(images.iter().map(|img| {
                json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{};base64,{}", img.mime_type, img.data)}
                })
            }));
            json!({"role": "user", "content": parts})
        }
        ChatTurn::Assistant { text, tool_calls } => {
            let mut msg = json!({"role": "assistant", "content": text});
            if !tool_calls.is_empty() {
                msg["tool_calls"] = tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {"name": c.name, "arguments": c.arguments},
                        })
                    })
                    .collect();
            }
            msg
        }
        ChatTurn::ToolResult {
            call_id, content, ..
        } => json!({"role": "tool", "tool_call_id": call_id, "content": content}),
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds Chat Completions chunks into [`ModelEvent`]s.
///
/// Tool calls stream as fragments keyed by `index`; they are emitted whole,
/// in index order, when the choice reports a `finish_reason`.
#[derive(Default)]
pub struct ChunkParser {
    tool_calls: BTreeMap<u64, PartialToolCall>,
    finished: bool,
}

impl ChunkParser {
    pub fn push(&mut self, data: &str) -> Result<Vec<ModelEvent>, ProviderError> {
        let chunk: Value =
            serde_json::from_str(data).map_err(|e| ProviderError::Decode(e.to_string()))?;

        if let Some(err) = chunk.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Err(ProviderError::Remote(message));
        }

        let mut events = Vec::new();
        if self.finished {
            return Ok(events);
        }
        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return Ok(events);
        };

        if let Some(delta) = choice.get("delta") {
            let reasoning = delta
                .get("reasoning_content")
                .or_else(|| delta.get("reasoning"))
                .and_then(Value::as_str);
            if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
                events.push(ModelEvent::ReasoningDelta(text.to_string()));
            }
            if let Some(text) = delta
                .get("content")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
            {
                events.push(ModelEvent::TextDelta(text.to_string()));
            }
            if let Some(fragments) = delta.get("tool_calls").and_then(Value::as_array) {
                for fragment in fragments {
                    self.accumulate(fragment);
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finished = true;
            events.extend(self.drain_tool_calls());
            events.push(ModelEvent::Finish(FinishReason::parse(reason)));
        }
        Ok(events)
    }

    /// Flush at end of stream when no `finish_reason` arrived.
    pub fn finish(&mut self) -> Vec<ModelEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut events = self.drain_tool_calls();
        let reason = if events.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        events.push(ModelEvent::Finish(reason));
        events
    }

    fn accumulate(&mut self, fragment: &Value) {
        let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
        let entry = self.tool_calls.entry(index).or_default();
        if let Some(id) = fragment.get("id").and_then(Value::as_str) {
            entry.id = id.to_string();
        }
        if let Some(function) = fragment.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                entry.name.push_str(name);
            }
            if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                entry.arguments.push_str(args);
            }
        }
    }

    fn drain_tool_calls(&mut self) -> Vec<ModelEvent> {
        std::mem::take(&mut self.tool_calls)
            .into_iter()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| {
                ModelEvent::ToolCall(ModelToolCall {
                    id: if call.id.is_empty() {
                        format!("call_{index}")
                    } else {
                        call.id
                    },
                    name: call.name,
                    arguments: call.arguments,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ReasoningOptions;
    use parley_core::{Attachment, ReasoningEffort, ToolDescriptor};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ModelRequest {
        ModelRequest {
            model: "gpt-4o".into(),
            system: Some("be brief".into()),
            turns: vec![ChatTurn::user("hi")],
            tools: Vec::new(),
            temperature: None,
            reasoning: None,
        }
    }

    fn sse_body(chunks: &[Value]) -> String {
        let mut body: String = chunks.iter().map(|c| format!("data: {c}\n\n")).collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[test]
    fn body_has_system_tools_and_reasoning() {
        let mut req = request();
        req.temperature = Some(0.2);
        req.reasoning = Some(ReasoningOptions {
            effort: Some(ReasoningEffort::Medium),
        });
        req.tools = vec![ToolDescriptor {
            name: "fs__read".into(),
            tool_name: "read".into(),
            description: "Read a file".into(),
            input_schema: json!({"type": "object"}),
            provider_id: "fs".into(),
        }];
        let body = build_body(ProviderType::OpenAi, &req);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["tools"][0]["function"]["name"], "fs__read");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["reasoning_effort"], "medium");
    }

    #[test]
    fn images_become_data_urls() {
        let msg = turn_to_message(&ChatTurn::User {
            text: "what is this".into(),
            images: vec![Attachment {
                mime_type: "image/png".into(),
                data: "AAAA".into(),
                name: None,
            }],
        });
        assert_eq!(msg["content"][1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn tool_turns_round_out_the_exchange() {
        let call = ModelToolCall {
            id: "call_1".into(),
            name: "fs__read".into(),
            arguments: "{}".into(),
        };
        let assistant = turn_to_message(&ChatTurn::Assistant {
            text: String::new(),
            tool_calls: vec![call],
        });
        assert_eq!(assistant["tool_calls"][0]["function"]["name"], "fs__read");
        let result = turn_to_message(&ChatTurn::ToolResult {
            call_id: "call_1".into(),
            name: "fs__read".into(),
            content: "ok".into(),
        });
        assert_eq!(result["role"], "tool");
        assert_eq!(result["tool_call_id"], "call_1");
    }

    #[test]
    fn parser_text_reasoning_and_finish() {
        let mut p = ChunkParser::default();
        let ev = p
            .push(r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#)
            .unwrap();
        assert_eq!(ev, vec![ModelEvent::ReasoningDelta("hmm".into())]);
        let ev = p.push(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap();
        assert_eq!(ev, vec![ModelEvent::TextDelta("Hi".into())]);
        let ev = p
            .push(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#)
            .unwrap();
        assert_eq!(ev, vec![ModelEvent::Finish(FinishReason::Stop)]);
        assert!(p.finish().is_empty());
    }

    #[test]
    fn parser_accumulates_tool_fragments() {
        let mut p = ChunkParser::default();
        p.push(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"fs__read","arguments":"{\"pa"}}]}}]}"#).unwrap();
        p.push(r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"web__get","arguments":"{}"}}]}}]}"#).unwrap();
        p.push(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\"a\"}"}}]}}]}"#).unwrap();
        let ev = p
            .push(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#)
            .unwrap();
        assert_eq!(ev.len(), 3);
        assert_eq!(
            ev[0],
            ModelEvent::ToolCall(ModelToolCall {
                id: "call_a".into(),
                name: "fs__read".into(),
                arguments: r#"{"path":"a"}"#.into(),
            })
        );
        assert!(matches!(&ev[1], ModelEvent::ToolCall(c) if c.name == "web__get"));
        assert_eq!(ev[2], ModelEvent::Finish(FinishReason::ToolCalls));
    }

    #[test]
    fn parser_flushes_without_finish_reason() {
        let mut p = ChunkParser::default();
        p.push(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"x","arguments":"{}"}}]}}]}"#).unwrap();
        let ev = p.finish();
        assert!(matches!(&ev[0], ModelEvent::ToolCall(c) if c.id == "call_0"));
        assert_eq!(ev[1], ModelEvent::Finish(FinishReason::ToolCalls));
    }

    #[test]
    fn parser_surfaces_inline_errors() {
        let mut p = ChunkParser::default();
        let err = p.push(r#"{"error":{"message":"quota exceeded"}}"#).unwrap_err();
        assert_eq!(err.to_string(), "provider error: quota exceeded");
        assert!(matches!(p.push("not json"), Err(ProviderError::Decode(_))));
    }

    #[tokio::test]
    async fn streams_from_http_endpoint() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            json!({"choices":[{"delta":{"content":"Hel"}}]}),
            json!({"choices":[{"delta":{"content":"lo"}}]}),
            json!({"choices":[{"delta":{},"finish_reason":"stop"}]}),
        ]);
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(
            reqwest::Client::new(),
            ProviderType::OpenAi,
            format!("{}/v1", server.uri()),
            SecretString::from("sk-test"),
            Duration::from_secs(5),
        );
        let stream = client.stream(&request()).await.unwrap();
        let events: Vec<ModelEvent> = stream.map(Result::unwrap).collect().await;
        assert_eq!(
            events,
            vec![
                ModelEvent::TextDelta("Hel".into()),
                ModelEvent::TextDelta("lo".into()),
                ModelEvent::Finish(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn http_error_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(
            reqwest::Client::new(),
            ProviderType::Groq,
            server.uri(),
            SecretString::from("nope"),
            Duration::from_secs(5),
        );
        let err = client.stream(&request()).await.err().unwrap();
        assert!(matches!(err, ProviderError::AuthenticationFailed(ref b) if b == "bad key"));
    }
}
