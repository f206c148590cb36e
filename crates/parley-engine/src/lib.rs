pub mod artifacts;
pub mod orchestrator;
pub mod reconciler;

pub use orchestrator::{Orchestrator, TranscriptUpdate, TurnOutcome};
pub use reconciler::{agent_event_label, Transcript};
