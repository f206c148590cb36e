//! Folds adapter events into an ordered transcript.
//!
//! The reconciler is a synchronous state transition with no concurrency of
//! its own. Callers feed it one session's events in arrival order; the
//! single-stream rule is enforced one level up by the orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use parley_core::{Message, MessageId, Segment, StopReason, StreamEvent};

use crate::artifacts;

/// Messages of one session plus the streaming pointer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub messages: Vec<Message>,
    /// Message currently receiving streamed content.
    pub active: Option<MessageId>,
    pub stop_reason: Option<StopReason>,
}

impl Transcript {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            active: None,
            stop_reason: None,
        }
    }

    /// Apply one event. Returns `false` when the event left the transcript
    /// untouched.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        trace!(kind = event.kind(), "apply");
        match event {
            StreamEvent::Delta { text } => {
                let msg = self.ensure_active();
                msg.content.push_str(&text);
                match msg.segments.last_mut() {
                    Some(Segment::Text { content }) => content.push_str(&text),
                    _ => msg.segments.push(Segment::Text { content: text }),
                }
                true
            }
            StreamEvent::ReasoningDelta { text } => {
                self.ensure_active()
                    .reasoning
                    .get_or_insert_with(String::new)
                    .push_str(&text);
                true
            }
            StreamEvent::ToolCallStart { tool_name, input } => {
                self.ensure_active()
                    .segments
                    .push(Segment::open_tool_call(tool_name, input));
                true
            }
            StreamEvent::ToolCallEnd { tool_name, result } => {
                self.complete_tool_call(tool_name.as_deref(), result)
            }
            StreamEvent::Thought { content } => {
                self.ensure_active()
                    .segments
                    .push(Segment::Thought { content });
                true
            }
            StreamEvent::AgentEvent { event_type, data } => {
                let Some(label) = agent_event_label(&event_type, &data) else {
                    return false;
                };
                let detail = data.is_object().then(|| data.to_string());
                self.ensure_active().segments.push(Segment::AgentEvent {
                    event_type,
                    label,
                    detail,
                });
                true
            }
            StreamEvent::Stop { reason } => {
                if let Some(msg) = self.take_active() {
                    msg.is_streaming = false;
                    msg.artifacts = artifacts::detect(&msg.content);
                }
                self.stop_reason = Some(reason);
                true
            }
            StreamEvent::Error { detail } => {
                if let Some(msg) = self.take_active() {
                    msg.is_streaming = false;
                }
                self.messages.push(Message::system(format!("Error: {detail}")));
                true
            }
        }
    }

    /// Apply events in order.
    pub fn fold(&mut self, events: impl IntoIterator<Item = StreamEvent>) {
        for event in events {
            self.apply(event);
        }
    }

    /// Number of messages flagged as streaming; never more than one.
    pub fn streaming_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_streaming).count()
    }

    pub fn active_message(&self) -> Option<&Message> {
        let id = self.active.as_ref()?;
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn index_of_active(&self) -> Option<usize> {
        let id = self.active.as_ref()?;
        self.messages.iter().rposition(|m| &m.id == id)
    }

    /// The active message, creating a streaming assistant message when none
    /// is active.
    fn ensure_active(&mut self) -> &mut Message {
        let idx = match self.index_of_active() {
            Some(idx) => idx,
            None => {
                let msg = Message::streaming_assistant();
                self.active = Some(msg.id.clone());
                self.messages.push(msg);
                self.messages.len() - 1
            }
        };
        &mut self.messages[idx]
    }

    /// Clear the pointer and hand back the message it pointed at.
    fn take_active(&mut self) -> Option<&mut Message> {
        let idx = self.index_of_active();
        self.active = None;
        idx.map(|idx| &mut self.messages[idx])
    }

    /// Last-open-wins: the most recent incomplete call with this name, else
    /// the most recent incomplete call of any name.
    fn complete_tool_call(&mut self, tool_name: Option<&str>, result: String) -> bool {
        let Some(idx) = self.index_of_active() else {
            return false;
        };
        let segments = &mut self.messages[idx].segments;

        let by_name = tool_name.and_then(|wanted| {
            segments.iter().rposition(|s| {
                matches!(
                    s,
                    Segment::ToolCall { tool_name, is_complete: false, .. } if tool_name == wanted
                )
            })
        });
        let Some(pos) = by_name.or_else(|| segments.iter().rposition(Segment::is_open_tool_call))
        else {
            return false;
        };

        if let Segment::ToolCall {
            result: slot,
            is_complete,
            ..
        } = &mut segments[pos]
        {
            *slot = Some(result);
            *is_complete = true;
        }
        true
    }
}

/// Display label for an agent event type; `None` for types that are not shown.
pub fn agent_event_label(event_type: &str, data: &Value) -> Option<String> {
    let label = match event_type {
        "planning:update" => "Planning updated".to_string(),
        "subagent:spawn" => "Sub-agent started".to_string(),
        "subagent:complete" => "Sub-agent completed".to_string(),
        "step:start" => {
            let index = data.get("stepIndex").and_then(Value::as_u64).unwrap_or(0);
            format!("Step {}", index + 1)
        }
        "context:summarize" => "Context summarized".to_string(),
        "checkpoint:save" => "Checkpoint saved".to_string(),
        _ => return None,
    };
    Some(label)
}

#[cfg(test)]
mod tests {
    use parley_core::Role;
    use serde_json::json;

    use super::*;

    fn start(name: &str) -> StreamEvent {
        StreamEvent::ToolCallStart {
            tool_name: name.into(),
            input: "{}".into(),
        }
    }

    fn end(name: Option<&str>, result: &str) -> StreamEvent {
        StreamEvent::ToolCallEnd {
            tool_name: name.map(str::to_string),
            result: result.into(),
        }
    }

    fn tool_results(msg: &Message) -> Vec<(String, Option<String>, bool)> {
        msg.tool_calls()
            .map(|s| match s {
                Segment::ToolCall {
                    tool_name,
                    result,
                    is_complete,
                    ..
                } => (tool_name.clone(), result.clone(), *is_complete),
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn deltas_merge_into_one_text_segment() {
        let mut t = Transcript::default();
        t.fold([StreamEvent::delta("Hi "), StreamEvent::delta("there")]);

        assert_eq!(t.messages.len(), 1);
        let msg = &t.messages[0];
        assert_eq!(msg.content, "Hi there");
        assert_eq!(msg.segments, vec![Segment::text("Hi there")]);
        assert!(msg.is_streaming);
        assert_eq!(t.active.as_ref(), Some(&msg.id));
    }

    #[test]
    fn text_after_tool_call_starts_new_segment() {
        let mut t = Transcript::default();
        t.fold([
            StreamEvent::delta("a"),
            start("search"),
            end(Some("search"), "R"),
            StreamEvent::delta("b"),
        ]);
        let msg = &t.messages[0];
        assert_eq!(msg.content, "ab");
        assert_eq!(msg.segments.len(), 3);
        assert_eq!(msg.segments[2], Segment::text("b"));
    }

    #[test]
    fn tool_call_completes_once() {
        let mut t = Transcript::default();
        t.fold([start("search"), end(Some("search"), "R1")]);
        assert_eq!(
            tool_results(&t.messages[0]),
            vec![("search".into(), Some("R1".into()), true)]
        );

        // A stray end with nothing open is a no-op.
        assert!(!t.apply(end(Some("search"), "R2")));
        assert_eq!(
            tool_results(&t.messages[0]),
            vec![("search".into(), Some("R1".into()), true)]
        );
    }

    #[test]
    fn last_open_call_wins() {
        let mut t = Transcript::default();
        t.fold([start("search"), start("search"), end(Some("search"), "R")]);
        assert_eq!(
            tool_results(&t.messages[0]),
            vec![
                ("search".into(), None, false),
                ("search".into(), Some("R".into()), true),
            ]
        );
    }

    #[test]
    fn name_match_before_fallback() {
        let mut t = Transcript::default();
        t.fold([start("read"), start("write"), end(Some("read"), "r")]);
        assert_eq!(
            tool_results(&t.messages[0]),
            vec![
                ("read".into(), Some("r".into()), true),
                ("write".into(), None, false),
            ]
        );

        t.apply(end(Some("unknown"), "u"));
        assert_eq!(tool_results(&t.messages[0])[1].1.as_deref(), Some("u"));
    }

    #[test]
    fn nameless_result_completes_latest_open_call() {
        let mut t = Transcript::default();
        t.fold([start("a"), start("b"), end(None, "x")]);
        let calls = tool_results(&t.messages[0]);
        assert!(!calls[0].2);
        assert_eq!(calls[1].1.as_deref(), Some("x"));
    }

    #[test]
    fn reasoning_kept_apart_from_content() {
        let mut t = Transcript::default();
        t.fold([
            StreamEvent::ReasoningDelta { text: "hm".into() },
            StreamEvent::ReasoningDelta { text: "m".into() },
            StreamEvent::delta("answer"),
        ]);
        let msg = &t.messages[0];
        assert_eq!(msg.reasoning.as_deref(), Some("hmm"));
        assert_eq!(msg.content, "answer");
        assert_eq!(msg.segments, vec![Segment::text("answer")]);
    }

    #[test]
    fn stop_finalizes_and_detects_artifacts() {
        let mut t = Transcript::default();
        t.fold([
            StreamEvent::delta("```sh\nls\n```"),
            StreamEvent::stop("end_turn"),
        ]);
        let msg = &t.messages[0];
        assert!(!msg.is_streaming);
        assert_eq!(msg.artifacts.len(), 1);
        assert_eq!(msg.artifacts[0].content, "ls");
        assert!(t.active.is_none());
        assert_eq!(t.stop_reason, Some(StopReason::end_turn()));
        assert_eq!(t.streaming_count(), 0);
    }

    #[test]
    fn error_keeps_partial_message_and_appends_system_message() {
        let mut t = Transcript::default();
        t.fold([StreamEvent::delta("partial"), StreamEvent::error("boom")]);

        assert_eq!(t.messages.len(), 2);
        assert_eq!(t.messages[0].content, "partial");
        assert!(!t.messages[0].is_streaming);
        assert_eq!(t.messages[1].role, Role::System);
        assert_eq!(t.messages[1].content, "Error: boom");
        assert!(t.active.is_none());
        assert_eq!(t.stop_reason, None);
    }

    #[test]
    fn error_without_active_message() {
        let mut t = Transcript::new(vec![Message::user("hi", Vec::new())]);
        t.apply(StreamEvent::error("no key"));
        assert_eq!(t.messages.len(), 2);
        assert_eq!(t.streaming_count(), 0);
    }

    #[test]
    fn agent_events_are_labelled_or_dropped() {
        let mut t = Transcript::default();
        assert!(t.apply(StreamEvent::AgentEvent {
            event_type: "step:start".into(),
            data: json!({"stepIndex": 2}),
        }));
        assert!(!t.apply(StreamEvent::AgentEvent {
            event_type: "telemetry:ping".into(),
            data: json!({}),
        }));

        let msg = &t.messages[0];
        assert_eq!(msg.segments.len(), 1);
        assert_eq!(
            msg.segments[0],
            Segment::AgentEvent {
                event_type: "step:start".into(),
                label: "Step 3".into(),
                detail: Some(r#"{"stepIndex":2}"#.into()),
            }
        );
    }

    #[test]
    fn unlabelled_agent_event_creates_nothing() {
        let mut t = Transcript::default();
        t.apply(StreamEvent::AgentEvent {
            event_type: "unknown".into(),
            data: Value::Null,
        });
        assert!(t.messages.is_empty());
        assert!(t.active.is_none());
    }

    #[test]
    fn thought_does_not_clear_pointer() {
        let mut t = Transcript::default();
        t.fold([
            StreamEvent::Thought {
                content: "plan".into(),
            },
            StreamEvent::delta("x"),
        ]);
        assert_eq!(t.messages.len(), 1);
        assert!(t.active.is_some());
    }

    #[test]
    fn at_most_one_streaming_message_at_every_prefix() {
        let events = vec![
            StreamEvent::ReasoningDelta { text: "r".into() },
            StreamEvent::delta("a"),
            start("t"),
            StreamEvent::Thought {
                content: "th".into(),
            },
            end(Some("t"), "ok"),
            StreamEvent::AgentEvent {
                event_type: "checkpoint:save".into(),
                data: json!({}),
            },
            StreamEvent::delta("b"),
        ];
        let terminals = [
            StreamEvent::stop("end_turn"),
            StreamEvent::abort(),
            StreamEvent::error("x"),
        ];
        for terminal in terminals {
            let mut t = Transcript::new(vec![Message::user("q", Vec::new())]);
            for event in events.iter().cloned() {
                t.apply(event);
                assert!(t.streaming_count() <= 1);
            }
            t.apply(terminal);
            assert_eq!(t.streaming_count(), 0);
            assert!(t.active.is_none());
        }
    }

    #[test]
    fn delta_after_stop_opens_new_message() {
        let mut t = Transcript::default();
        t.fold([
            StreamEvent::delta("one"),
            StreamEvent::stop("end_turn"),
            StreamEvent::delta("two"),
        ]);
        assert_eq!(t.messages.len(), 2);
        assert_eq!(t.streaming_count(), 1);
    }
}
