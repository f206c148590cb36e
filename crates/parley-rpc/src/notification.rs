//! Maps `session/update` payloads onto [`StreamEvent`]s.
//!
//! An explicit, recognized `kind` wins and yields exactly one event. Without
//! one, field presence implies intent, checked in a fixed order (`text`,
//! `toolCall`, `toolResult`, `thought`, `stopReason`), and a single payload
//! can yield several events. A bare `message.content` is the last resort.
//! Anything else yields nothing.

use parley_core::StreamEvent;
use serde_json::{Map, Value};

type Object = Map<String, Value>;

/// The session a payload belongs to, when it names one.
pub fn session_id_of(params: &Value) -> Option<&str> {
    params.get("sessionId").and_then(Value::as_str)
}

pub fn classify_update(params: &Value) -> Vec<StreamEvent> {
    let Some(obj) = params.as_object() else {
        return Vec::new();
    };

    if let Some(update) = obj.get("update").and_then(Value::as_object) {
        if let Some(events) = classify_acp_update(update) {
            return events;
        }
    }

    if let Some(kind) = obj.get("kind").and_then(Value::as_str) {
        if let Some(event) = event_for_kind(kind, obj) {
            return vec![event];
        }
    }

    let mut events = Vec::new();
    if let Some(text) = obj.get("text").and_then(Value::as_str) {
        events.push(StreamEvent::delta(text));
    }
    if let Some(tc) = obj.get("toolCall").and_then(Value::as_object) {
        events.push(tool_call_start(tc));
    }
    if let Some(tr) = obj.get("toolResult") {
        events.push(match tr.as_object() {
            Some(tr) => tool_call_end(tr),
            None => StreamEvent::ToolCallEnd {
                tool_name: None,
                result: stringify(tr),
            },
        });
    }
    if let Some(thought) = obj.get("thought").and_then(Value::as_str) {
        events.push(StreamEvent::Thought {
            content: thought.to_string(),
        });
    }
    if let Some(reason) = obj.get("stopReason").and_then(Value::as_str) {
        events.push(StreamEvent::stop(reason));
    }

    if events.is_empty() {
        if let Some(content) = obj
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
        {
            events.push(StreamEvent::delta(content));
        }
    }
    events
}

fn event_for_kind(kind: &str, obj: &Object) -> Option<StreamEvent> {
    let event = match kind {
        "text" => StreamEvent::delta(str_field(obj, "text").unwrap_or_default()),
        "reasoning" => StreamEvent::ReasoningDelta {
            text: str_field(obj, "text").unwrap_or_default().to_string(),
        },
        "toolCall" => tool_call_start(nested_or_self(obj, "toolCall")),
        "toolResult" => tool_call_end(nested_or_self(obj, "toolResult")),
        "thought" => StreamEvent::Thought {
            content: str_field(obj, "thought")
                .or_else(|| str_field(obj, "content"))
                .unwrap_or_default()
                .to_string(),
        },
        "stop" => StreamEvent::stop(
            str_field(obj, "stopReason")
                .or_else(|| str_field(obj, "reason"))
                .unwrap_or(parley_core::StopReason::END_TURN),
        ),
        "agentEvent" => StreamEvent::AgentEvent {
            event_type: str_field(obj, "eventType")
                .or_else(|| str_field(obj, "type"))?
                .to_string(),
            data: obj.get("data").cloned().unwrap_or(Value::Null),
        },
        _ => return None,
    };
    Some(event)
}

/// ACP's `{"update": {"sessionUpdate": ...}}` shape. `None` means the
/// discriminator is unknown and the outer payload should be sniffed instead.
fn classify_acp_update(update: &Object) -> Option<Vec<StreamEvent>> {
    let discriminator = str_field(update, "sessionUpdate")?;
    let events = match discriminator {
        "agent_message_chunk" => content_text(update)
            .map(|text| vec![StreamEvent::delta(text)])
            .unwrap_or_default(),
        "agent_thought_chunk" => content_text(update)
            .map(|text| vec![StreamEvent::ReasoningDelta { text }])
            .unwrap_or_default(),
        "tool_call" => {
            let tool_name = str_field(update, "title")
                .or_else(|| str_field(update, "name"))
                .or_else(|| str_field(update, "kind"))
                .unwrap_or("unknown");
            let input = update.get("rawInput").map(stringify).unwrap_or_default();
            vec![StreamEvent::ToolCallStart {
                tool_name: tool_name.to_string(),
                input,
            }]
        }
        "tool_call_update" => match str_field(update, "status") {
            Some("completed" | "failed") => {
                let result = content_text(update)
                    .or_else(|| update.get("rawOutput").map(stringify))
                    .unwrap_or_default();
                vec![StreamEvent::ToolCallEnd {
                    tool_name: str_field(update, "title").map(str::to_string),
                    result,
                }]
            }
            _ => Vec::new(),
        },
        "plan" => vec![StreamEvent::AgentEvent {
            event_type: "planning:update".into(),
            data: update.get("entries").cloned().unwrap_or(Value::Null),
        }],
        "user_message_chunk" | "available_commands_update" | "current_mode_update" => Vec::new(),
        _ => return None,
    };
    Some(events)
}

fn tool_call_start(tc: &Object) -> StreamEvent {
    let tool_name = str_field(tc, "name")
        .or_else(|| str_field(tc, "toolName"))
        .unwrap_or("unknown");
    let input = tc
        .get("input")
        .or_else(|| tc.get("arguments"))
        .map(stringify)
        .unwrap_or_default();
    StreamEvent::ToolCallStart {
        tool_name: tool_name.to_string(),
        input,
    }
}

fn tool_call_end(tr: &Object) -> StreamEvent {
    let result = tr
        .get("result")
        .or_else(|| tr.get("output"))
        .map(stringify)
        .unwrap_or_default();
    let tool_name = str_field(tr, "name")
        .or_else(|| str_field(tr, "toolName"))
        .map(str::to_string);
    StreamEvent::ToolCallEnd { tool_name, result }
}

fn nested_or_self<'a>(obj: &'a Object, key: &str) -> &'a Object {
    obj.get(key).and_then(Value::as_object).unwrap_or(obj)
}

fn str_field<'a>(obj: &'a Object, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Strings pass through; anything else is rendered as JSON.
fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Text of an ACP content block, or of a list of blocks joined by newlines.
fn content_text(update: &Object) -> Option<String> {
    let content = update.get("content")?;
    let block_text = |b: &Value| {
        b.get("text")
            .and_then(Value::as_str)
            .or_else(|| b.get("content").and_then(|c| c.get("text")).and_then(Value::as_str))
            .map(str::to_string)
    };
    match content {
        Value::Array(blocks) => {
            let parts: Vec<String> = blocks.iter().filter_map(block_text).collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        Value::String(s) => Some(s.clone()),
        other => block_text(other),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn explicit_kind_wins_over_other_fields() {
        let events = classify_update(&json!({
            "kind": "thought",
            "thought": "planning",
            "text": "ignored",
            "stopReason": "end_turn"
        }));
        assert_eq!(
            events,
            vec![StreamEvent::Thought {
                content: "planning".into()
            }]
        );
    }

    #[test]
    fn kind_tool_call_reads_fields_from_payload_itself() {
        let events = classify_update(&json!({
            "kind": "toolCall",
            "toolName": "search",
            "arguments": {"q": "rust"}
        }));
        assert_eq!(
            events,
            vec![StreamEvent::ToolCallStart {
                tool_name: "search".into(),
                input: r#"{"q":"rust"}"#.into()
            }]
        );
    }

    #[test]
    fn kind_stop_defaults_to_end_turn() {
        assert_eq!(
            classify_update(&json!({"kind": "stop"})),
            vec![StreamEvent::stop("end_turn")]
        );
        assert_eq!(
            classify_update(&json!({"kind": "stop", "reason": "refusal"})),
            vec![StreamEvent::stop("refusal")]
        );
    }

    #[test]
    fn field_presence_yields_events_in_fixed_order() {
        let events = classify_update(&json!({
            "stopReason": "end_turn",
            "thought": "t",
            "toolResult": {"result": "R1"},
            "toolCall": {"name": "search", "input": "q"},
            "text": "Hi"
        }));
        let kinds: Vec<&str> = events.iter().map(StreamEvent::kind).collect();
        assert_eq!(
            kinds,
            vec!["delta", "tool_call_start", "tool_call_end", "thought", "stop"]
        );
    }

    #[test]
    fn non_string_tool_result_is_rendered_as_json() {
        let events = classify_update(&json!({"toolResult": {"output": {"rows": 2}}}));
        assert_eq!(
            events,
            vec![StreamEvent::ToolCallEnd {
                tool_name: None,
                result: r#"{"rows":2}"#.into()
            }]
        );
    }

    #[test]
    fn message_content_fallback() {
        let events = classify_update(&json!({"message": {"content": "hello"}}));
        assert_eq!(events, vec![StreamEvent::delta("hello")]);
    }

    #[test]
    fn unrecognized_payload_yields_nothing() {
        assert!(classify_update(&json!({"foo": 1})).is_empty());
        assert!(classify_update(&json!({"kind": "mystery"})).is_empty());
        assert!(classify_update(&json!("just a string")).is_empty());
        assert!(classify_update(&Value::Null).is_empty());
    }

    #[test]
    fn agent_event_kind() {
        let events = classify_update(&json!({
            "kind": "agentEvent",
            "eventType": "step:start",
            "data": {"stepIndex": 2}
        }));
        assert_eq!(
            events,
            vec![StreamEvent::AgentEvent {
                event_type: "step:start".into(),
                data: json!({"stepIndex": 2})
            }]
        );
        assert!(classify_update(&json!({"kind": "agentEvent"})).is_empty());
    }

    #[test]
    fn acp_message_and_thought_chunks() {
        let events = classify_update(&json!({
            "sessionId": "s1",
            "update": {"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "Hi"}}
        }));
        assert_eq!(events, vec![StreamEvent::delta("Hi")]);

        let events = classify_update(&json!({
            "update": {"sessionUpdate": "agent_thought_chunk", "content": {"type": "text", "text": "hmm"}}
        }));
        assert_eq!(events, vec![StreamEvent::ReasoningDelta { text: "hmm".into() }]);
    }

    #[test]
    fn acp_tool_call_lifecycle() {
        let start = classify_update(&json!({
            "update": {"sessionUpdate": "tool_call", "toolCallId": "t1", "title": "read_file",
                       "rawInput": {"path": "a.rs"}, "status": "pending"}
        }));
        assert_eq!(
            start,
            vec![StreamEvent::ToolCallStart {
                tool_name: "read_file".into(),
                input: r#"{"path":"a.rs"}"#.into()
            }]
        );

        let progress = classify_update(&json!({
            "update": {"sessionUpdate": "tool_call_update", "toolCallId": "t1", "status": "in_progress"}
        }));
        assert!(progress.is_empty());

        let done = classify_update(&json!({
            "update": {"sessionUpdate": "tool_call_update", "toolCallId": "t1", "status": "completed",
                       "content": [{"type": "content", "content": {"type": "text", "text": "fn main"}}]}
        }));
        assert_eq!(
            done,
            vec![StreamEvent::ToolCallEnd {
                tool_name: None,
                result: "fn main".into()
            }]
        );
    }

    #[test]
    fn acp_plan_becomes_planning_event() {
        let events = classify_update(&json!({
            "update": {"sessionUpdate": "plan", "entries": [{"content": "step one"}]}
        }));
        assert!(matches!(
            &events[..],
            [StreamEvent::AgentEvent { event_type, .. }] if event_type == "planning:update"
        ));
    }

    #[test]
    fn unknown_acp_update_falls_back_to_outer_fields() {
        let events = classify_update(&json!({
            "update": {"sessionUpdate": "brand_new_thing"},
            "text": "outer"
        }));
        assert_eq!(events, vec![StreamEvent::delta("outer")]);
    }

    #[test]
    fn session_id_lookup() {
        assert_eq!(session_id_of(&json!({"sessionId": "s1"})), Some("s1"));
        assert_eq!(session_id_of(&json!({})), None);
    }
}
