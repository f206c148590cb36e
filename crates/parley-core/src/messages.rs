use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One typed unit of assistant output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text {
        content: String,
    },
    ToolCall {
        tool_name: String,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        is_complete: bool,
    },
    Thought {
        content: String,
    },
    AgentEvent {
        event_type: String,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl Segment {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn open_tool_call(tool_name: impl Into<String>, input: impl Into<String>) -> Self {
        Self::ToolCall {
            tool_name: tool_name.into(),
            input: input.into(),
            result: None,
            is_complete: false,
        }
    }

    pub fn is_open_tool_call(&self) -> bool {
        matches!(self, Self::ToolCall { is_complete: false, .. })
    }
}

/// Input media attached to a user message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Code,
}

/// Structured block extracted from finalized assistant content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub is_streaming: bool,
    pub created_at: DateTime<Utc>,
}

// --- Convenience constructors ---

impl Message {
    fn base(role: Role, content: String) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            segments: Vec::new(),
            attachments: Vec::new(),
            artifacts: Vec::new(),
            reasoning: None,
            is_streaming: false,
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            attachments,
            ..Self::base(Role::User, text.into())
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::base(Role::System, text.into())
    }

    /// Empty assistant message that is receiving streamed content.
    pub fn streaming_assistant() -> Self {
        Self {
            is_streaming: true,
            ..Self::base(Role::Assistant, String::new())
        }
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::ToolCall { .. }))
    }

    pub fn has_open_tool_call(&self) -> bool {
        self.segments.iter().any(Segment::is_open_tool_call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_wire_shape() {
        let seg = Segment::open_tool_call("search", r#"{"q":"rust"}"#);
        let json = serde_json::to_value(&seg).unwrap();
        assert_eq!(json["type"], "tool_call");
        assert_eq!(json["tool_name"], "search");
        assert_eq!(json["is_complete"], false);
        assert!(json.get("result").is_none());
    }

    #[test]
    fn agent_event_segment_omits_missing_detail() {
        let seg = Segment::AgentEvent {
            event_type: "checkpoint:save".into(),
            label: "Checkpoint saved".into(),
            detail: None,
        };
        let json = serde_json::to_string(&seg).unwrap();
        assert!(!json.contains("detail"));
    }

    #[test]
    fn user_message_keeps_attachments() {
        let msg = Message::user(
            "look",
            vec![Attachment {
                mime_type: "image/png".into(),
                data: "aGVsbG8=".into(),
                name: None,
            }],
        );
        assert_eq!(msg.role, Role::User);
        assert!(!msg.is_streaming);
        assert!(msg.attachments[0].is_image());
    }

    #[test]
    fn streaming_assistant_starts_empty() {
        let msg = Message::streaming_assistant();
        assert_eq!(msg.role, Role::Assistant);
        assert!(msg.is_streaming);
        assert!(msg.content.is_empty());
        assert!(msg.segments.is_empty());
        assert!(msg.reasoning.is_none());
    }

    #[test]
    fn persisted_message_without_optional_fields_parses() {
        let json = serde_json::json!({
            "id": "msg_1",
            "role": "system",
            "content": "Error: boom",
            "created_at": "2026-01-01T00:00:00Z"
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        assert_eq!(msg.role, Role::System);
        assert!(msg.segments.is_empty());
        assert!(!msg.is_streaming);
    }

    #[test]
    fn open_tool_call_detection() {
        let mut msg = Message::streaming_assistant();
        msg.segments.push(Segment::text("hi"));
        assert!(!msg.has_open_tool_call());
        msg.segments.push(Segment::open_tool_call("read", "{}"));
        assert!(msg.has_open_tool_call());
        assert_eq!(msg.tool_calls().count(), 1);
    }
}
