use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use parley_core::{Attachment, ProviderType, ReasoningEffort, ToolDescriptor};

use crate::error::ProviderError;

/// Provider-neutral conversation turn sent to a model.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatTurn {
    User {
        text: String,
        images: Vec<Attachment>,
    },
    Assistant {
        text: String,
        tool_calls: Vec<ModelToolCall>,
    },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// Complete tool call requested by the model. `arguments` is raw JSON text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

impl FinishReason {
    /// Normalise a wire-level finish reason from either API family.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" | "stop_sequence" => Self::Stop,
            "tool_calls" | "tool_use" | "function_call" => Self::ToolCalls,
            "length" | "max_tokens" => Self::Length,
            other => Self::Other(other.to_string()),
        }
    }

    /// Reason recorded on the terminal `stop` event.
    pub fn as_stop_reason(&self) -> &str {
        match self {
            Self::Stop => "end_turn",
            Self::ToolCalls => "tool_use",
            Self::Length => "max_tokens",
            Self::Other(raw) => raw,
        }
    }
}

/// Incremental output of one model call.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// Emitted once the call's arguments are fully streamed.
    ToolCall(ModelToolCall),
    Finish(FinishReason),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReasoningOptions {
    pub effort: Option<ReasoningEffort>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub system: Option<String>,
    pub turns: Vec<ChatTurn>,
    pub tools: Vec<ToolDescriptor>,
    pub temperature: Option<f64>,
    /// `None` when reasoning is disabled for the session.
    pub reasoning: Option<ReasoningOptions>,
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, ProviderError>> + Send>>;

/// One streaming model endpoint.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn provider(&self) -> ProviderType;

    /// Start a call. Errors before the first byte (status, network) come back
    /// as `Err`; failures mid-stream arrive as `Err` items.
    async fn stream(&self, request: &ModelRequest) -> Result<ModelStream, ProviderError>;
}
