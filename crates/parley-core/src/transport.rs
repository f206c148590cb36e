use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::events::StreamEvent;
use crate::messages::{Attachment, Message};
use crate::session::Session;
use crate::tools::ToolInvoker;

/// Ordered events produced by one `open` call.
pub type EventSource = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    RemoteAgent,
    Provider,
}

#[derive(Clone, Debug, Default)]
pub struct Prompt {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

/// Everything an adapter needs to run one turn.
pub struct OpenRequest {
    pub session: Session,
    /// Transcript so far, ending with the user message for this turn.
    pub history: Vec<Message>,
    pub prompt: Prompt,
    pub cancel: CancellationToken,
    pub tools: Arc<dyn ToolInvoker>,
}

/// One backend transport.
///
/// Implementations never fail out of `open`: every failure is reported as a
/// terminal `StreamEvent::Error`, and a signalled `cancel` token ends the
/// source with exactly one `StreamEvent::Stop { reason: "abort" }`.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn open(&self, request: OpenRequest) -> EventSource;
}
