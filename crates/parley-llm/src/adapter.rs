//! Provider-stream transport: drives a model client through one or more
//! steps, executing requested tools between steps.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::SecretString;
use serde_json::json;
use tracing::{debug, info, warn};

use parley_core::{
    Backend, BackendKind, CredentialPort, EventSource, Message, OpenRequest, ProviderConfig,
    Prompt, Role, StreamEvent, TransportAdapter,
};

use crate::catalog::{self, ClientOptions};
use crate::client::{
    ChatTurn, FinishReason, ModelClient, ModelEvent, ModelRequest, ReasoningOptions,
};
use crate::error::ProviderError;

/// Builds the streaming client for a session's provider binding.
pub trait ClientFactory: Send + Sync {
    fn create(
        &self,
        config: &ProviderConfig,
        api_key: SecretString,
    ) -> Result<Arc<dyn ModelClient>, ProviderError>;
}

/// Real HTTP clients from the provider catalogue.
pub struct HttpClientFactory {
    options: ClientOptions,
}

impl HttpClientFactory {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }
}

impl ClientFactory for HttpClientFactory {
    fn create(
        &self,
        config: &ProviderConfig,
        api_key: SecretString,
    ) -> Result<Arc<dyn ModelClient>, ProviderError> {
        catalog::build_client(config, api_key, &self.options)
    }
}

pub struct ProviderAdapter {
    credentials: Arc<dyn CredentialPort>,
    factory: Arc<dyn ClientFactory>,
    max_steps: u32,
}

impl ProviderAdapter {
    pub fn new(
        credentials: Arc<dyn CredentialPort>,
        factory: Arc<dyn ClientFactory>,
        max_steps: u32,
    ) -> Self {
        Self {
            credentials,
            factory,
            max_steps: max_steps.max(1),
        }
    }

    /// Adapter over real HTTP clients.
    pub fn http(
        credentials: Arc<dyn CredentialPort>,
        options: ClientOptions,
        max_steps: u32,
    ) -> Self {
        Self::new(credentials, Arc::new(HttpClientFactory::new(options)), max_steps)
    }
}

enum Next<T> {
    Cancelled,
    Ready(T),
}

#[async_trait]
impl TransportAdapter for ProviderAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Provider
    }

    async fn open(&self, request: OpenRequest) -> EventSource {
        let OpenRequest {
            session,
            history,
            prompt,
            cancel,
            tools,
        } = request;

        let Backend::Provider(config) = session.backend else {
            return single(StreamEvent::error("session is not bound to a model provider"));
        };

        let key = config.credential_key(&session.server_id);
        let Some(api_key) = self.credentials.get_api_key(&key) else {
            return single(StreamEvent::error(
                ProviderError::MissingCredentials(key).to_string(),
            ));
        };
        let client = match self.factory.create(&config, SecretString::from(api_key)) {
            Ok(client) => client,
            Err(e) => return single(StreamEvent::error(e.to_string())),
        };

        info!(
            session_id = %session.id,
            provider = %config.provider_type,
            model = %config.model_id,
            "provider stream opened"
        );

        let mut model_request = ModelRequest {
            model: config.model_id.clone(),
            system: config.system_prompt.clone(),
            turns: to_chat_turns(&history, prompt),
            tools: tools.tools(),
            temperature: config.temperature,
            reasoning: config.reasoning_enabled.then(|| ReasoningOptions {
                effort: config.reasoning_effort,
            }),
        };
        let max_steps = self.max_steps;

        Box::pin(async_stream::stream! {
            for step in 1..=max_steps {
                if cancel.is_cancelled() {
                    yield StreamEvent::abort();
                    return;
                }
                debug!(step, "model step");

                let opened = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Next::Cancelled,
                    opened = client.stream(&model_request) => Next::Ready(opened),
                };
                let mut source = match opened {
                    Next::Cancelled => {
                        yield StreamEvent::abort();
                        return;
                    }
                    Next::Ready(Ok(source)) => source,
                    Next::Ready(Err(e)) => {
                        warn!(error = %e, kind = e.error_kind(), "model call failed");
                        yield StreamEvent::error(e.to_string());
                        return;
                    }
                };

                let mut text = String::new();
                let mut calls = Vec::new();
                let mut finish = None;
                loop {
                    let next = tokio::select! {
                        biased;
                        () = cancel.cancelled() => Next::Cancelled,
                        item = source.next() => Next::Ready(item),
                    };
                    match next {
                        Next::Cancelled => {
                            yield StreamEvent::abort();
                            return;
                        }
                        Next::Ready(None) => break,
                        Next::Ready(Some(Ok(ModelEvent::TextDelta(delta)))) => {
                            text.push_str(&delta);
                            yield StreamEvent::delta(delta);
                        }
                        Next::Ready(Some(Ok(ModelEvent::ReasoningDelta(delta)))) => {
                            yield StreamEvent::ReasoningDelta { text: delta };
                        }
                        Next::Ready(Some(Ok(ModelEvent::ToolCall(call)))) => calls.push(call),
                        Next::Ready(Some(Ok(ModelEvent::Finish(reason)))) => finish = Some(reason),
                        Next::Ready(Some(Err(e))) => {
                            warn!(error = %e, kind = e.error_kind(), "model stream failed");
                            yield StreamEvent::error(e.to_string());
                            return;
                        }
                    }
                }

                if calls.is_empty() {
                    let reason = finish.unwrap_or(FinishReason::Stop);
                    yield StreamEvent::stop(reason.as_stop_reason());
                    return;
                }

                model_request.turns.push(ChatTurn::Assistant {
                    text,
                    tool_calls: calls.clone(),
                });
                for call in calls {
                    if cancel.is_cancelled() {
                        yield StreamEvent::abort();
                        return;
                    }
                    yield StreamEvent::ToolCallStart {
                        tool_name: call.name.clone(),
                        input: call.arguments.clone(),
                    };

                    let args = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                    let invoked = tokio::select! {
                        biased;
                        () = cancel.cancelled() => Next::Cancelled,
                        result = tools.invoke_to_text(&call.name, args) => Next::Ready(result),
                    };
                    let Next::Ready(result) = invoked else {
                        yield StreamEvent::abort();
                        return;
                    };

                    yield StreamEvent::ToolCallEnd {
                        tool_name: Some(call.name.clone()),
                        result: result.clone(),
                    };
                    model_request.turns.push(ChatTurn::ToolResult {
                        call_id: call.id,
                        name: call.name,
                        content: result,
                    });
                }
            }

            warn!(max_steps, "step limit reached with tool calls pending");
            yield StreamEvent::stop("max_steps");
        })
    }
}

/// Rebuild the model-facing conversation from the transcript.
///
/// Error notes (system messages) are not sent. Assistant tool activity is
/// represented by its text only. The prompt is appended when the history
/// does not already end with it.
pub fn to_chat_turns(history: &[Message], prompt: Prompt) -> Vec<ChatTurn> {
    let mut turns: Vec<ChatTurn> = history
        .iter()
        .filter_map(|msg| match msg.role {
            Role::User => Some(ChatTurn::User {
                text: msg.content.clone(),
                images: msg.attachments.iter().filter(|a| a.is_image()).cloned().collect(),
            }),
            Role::Assistant if !msg.content.is_empty() => {
                Some(ChatTurn::assistant(msg.content.clone()))
            }
            _ => None,
        })
        .collect();

    if !matches!(turns.last(), Some(ChatTurn::User { .. })) {
        turns.push(ChatTurn::User {
            text: prompt.text,
            images: prompt.attachments.into_iter().filter(|a| a.is_image()).collect(),
        });
    }
    turns
}

fn single(event: StreamEvent) -> EventSource {
    Box::pin(futures::stream::once(async move { event }))
}
