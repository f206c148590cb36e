use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a stream ended. Backends report free-form reasons; `abort` is reserved
/// for cooperative cancellation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StopReason(String);

impl StopReason {
    pub const ABORT: &'static str = "abort";
    pub const END_TURN: &'static str = "end_turn";

    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn abort() -> Self {
        Self(Self::ABORT.into())
    }

    pub fn end_turn() -> Self {
        Self(Self::END_TURN.into())
    }

    pub fn is_abort(&self) -> bool {
        self.0 == Self::ABORT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Internal event vocabulary shared by every transport adapter.
///
/// Ordering contract: any number of content events, then exactly one
/// terminal `Stop` or `Error`. Nothing follows a terminal event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    Delta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    ToolCallStart {
        tool_name: String,
        input: String,
    },
    /// `tool_name` is absent when the backend reports a bare result.
    ToolCallEnd {
        tool_name: Option<String>,
        result: String,
    },
    Thought {
        content: String,
    },
    AgentEvent {
        event_type: String,
        data: serde_json::Value,
    },
    Stop {
        reason: StopReason,
    },
    Error {
        detail: String,
    },
}

impl StreamEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self::Stop {
            reason: StopReason::new(reason),
        }
    }

    pub fn abort() -> Self {
        Self::Stop {
            reason: StopReason::abort(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self::Error {
            detail: detail.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop { .. } | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallEnd { .. } => "tool_call_end",
            Self::Thought { .. } => "thought",
            Self::AgentEvent { .. } => "agent_event",
            Self::Stop { .. } => "stop",
            Self::Error { .. } => "error",
        }
    }
}
