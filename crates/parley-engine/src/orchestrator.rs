//! Session orchestrator: one stream per session, persisted at each boundary.
//!
//! `send_prompt` drives a whole turn on the caller's task. Per-session state
//! sits behind a `parking_lot::Mutex` that is only held for synchronous
//! mutations, never across an await.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use parley_core::{
    Attachment, Backend, BackendKind, EngineError, Message, NoTools, OpenRequest,
    PersistencePort, Prompt, ServerId, Session, SessionId, StopReason, StreamEvent, ToolInvoker,
    TransportAdapter,
};

use crate::reconciler::Transcript;

const UPDATE_CAPACITY: usize = 1024;
const TITLE_CHARS: usize = 50;

/// How a turn ended.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TurnOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TurnOutcome {
    pub fn is_aborted(&self) -> bool {
        self.stop_reason.as_ref().is_some_and(StopReason::is_abort)
    }
}

/// Transcript changes fanned out to observers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptUpdate {
    MessageAppended {
        session_id: SessionId,
        message: Message,
    },
    MessageUpdated {
        session_id: SessionId,
        message: Message,
    },
    StreamFinished {
        session_id: SessionId,
        outcome: TurnOutcome,
    },
}

struct SlotState {
    session: Session,
    transcript: Transcript,
    /// Present exactly while a stream is running.
    cancel: Option<CancellationToken>,
}

struct SessionSlot {
    state: Mutex<SlotState>,
}

impl SessionSlot {
    fn new(session: Session, transcript: Transcript) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState {
                session,
                transcript,
                cancel: None,
            }),
        })
    }
}

/// Returns the slot to idle when the driving task finishes or is dropped.
struct StreamingGuard {
    slot: Arc<SessionSlot>,
}

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        let mut state = self.slot.state.lock();
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        if state.transcript.active.is_some() {
            state.transcript.apply(StreamEvent::abort());
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn PersistencePort>,
    adapters: HashMap<BackendKind, Arc<dyn TransportAdapter>>,
    tools: Arc<dyn ToolInvoker>,
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
    updates: broadcast::Sender<TranscriptUpdate>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn PersistencePort>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            store,
            adapters: HashMap::new(),
            tools: Arc::new(NoTools),
            sessions: DashMap::new(),
            updates,
        }
    }

    /// Register the adapter serving one backend kind, replacing any previous one.
    pub fn with_adapter(mut self, adapter: Arc<dyn TransportAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = tools;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptUpdate> {
        self.updates.subscribe()
    }

    fn slot(&self, session_id: &SessionId) -> Option<Arc<SessionSlot>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    fn publish(&self, update: TranscriptUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    #[instrument(skip(self, backend), fields(server_id = %server_id))]
    pub fn create_session(
        &self,
        server_id: ServerId,
        backend: Backend,
    ) -> Result<Session, EngineError> {
        let session = Session::new(server_id, backend);
        self.store.save_session(&session)?;
        self.sessions.insert(
            session.id.clone(),
            SessionSlot::new(session.clone(), Transcript::default()),
        );
        info!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// Bring a stored session and its transcript into memory. Loading an
    /// already loaded session returns it unchanged.
    #[instrument(skip(self), fields(server_id = %server_id, session_id = %session_id))]
    pub fn load_session(
        &self,
        server_id: &ServerId,
        session_id: &SessionId,
    ) -> Result<Session, EngineError> {
        if let Some(slot) = self.slot(session_id) {
            return Ok(slot.state.lock().session.clone());
        }

        let session = self
            .store
            .load_sessions(server_id)?
            .into_iter()
            .find(|s| &s.id == session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let mut messages = self.store.load_messages(server_id, session_id)?;
        // A transcript saved mid-stream comes back finalized.
        for msg in messages.iter_mut().filter(|m| m.is_streaming) {
            msg.is_streaming = false;
        }
        debug!(messages = messages.len(), "transcript loaded");

        let slot = SessionSlot::new(session.clone(), Transcript::new(messages));
        let slot = self
            .sessions
            .entry(session_id.clone())
            .or_insert(slot)
            .value()
            .clone();
        let loaded = slot.state.lock().session.clone();
        Ok(loaded)
    }

    /// Remove a session and its transcript. Rejected while streaming.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn delete_session(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let slot = self
            .slot(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let server_id = {
            let state = slot.state.lock();
            if state.cancel.is_some() {
                return Err(EngineError::InvalidState(format!(
                    "session {session_id} is streaming"
                )));
            }
            state.session.server_id.clone()
        };
        self.store.delete_session(&server_id, session_id)?;
        self.sessions.remove(session_id);
        info!("session deleted");
        Ok(())
    }

    /// Stored sessions of a server, most recently updated first.
    pub fn list_sessions(&self, server_id: &ServerId) -> Result<Vec<Session>, EngineError> {
        self.store.load_sessions(server_id)
    }

    pub fn session(&self, session_id: &SessionId) -> Option<Session> {
        self.slot(session_id).map(|s| s.state.lock().session.clone())
    }

    pub fn transcript(&self, session_id: &SessionId) -> Option<Transcript> {
        self.slot(session_id)
            .map(|s| s.state.lock().transcript.clone())
    }

    pub fn is_streaming(&self, session_id: &SessionId) -> bool {
        self.slot(session_id)
            .is_some_and(|s| s.state.lock().cancel.is_some())
    }

    /// Run one turn: append the user message, stream the backend's reply
    /// into the transcript and persist the result.
    ///
    /// Fails with `InvalidState`, before touching the transcript, when the
    /// session is unknown or already streaming.
    #[instrument(skip(self, text, attachments), fields(session_id = %session_id))]
    pub async fn send_prompt(
        &self,
        session_id: &SessionId,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<TurnOutcome, EngineError> {
        let text = text.into();
        let slot = self.slot(session_id).ok_or_else(|| {
            EngineError::InvalidState(format!("no loaded session {session_id}"))
        })?;

        let (session, history, cancel, user_message, titled) = {
            let mut state = slot.state.lock();
            if state.cancel.is_some() {
                return Err(EngineError::InvalidState(format!(
                    "session {session_id} is already streaming"
                )));
            }
            let kind = state.session.backend.kind();
            if !self.adapters.contains_key(&kind) {
                return Err(EngineError::InvalidState(format!(
                    "no transport for {kind:?} sessions"
                )));
            }

            let titled = state.transcript.messages.is_empty();
            if titled {
                state.session.title = Some(text.chars().take(TITLE_CHARS).collect());
            }
            state.session.touch();

            let user_message = Message::user(text.clone(), attachments.clone());
            state.transcript.messages.push(user_message.clone());
            state.transcript.stop_reason = None;

            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());
            (
                state.session.clone(),
                state.transcript.messages.clone(),
                cancel,
                user_message,
                titled,
            )
        };
        let _guard = StreamingGuard { slot: slot.clone() };

        self.persist_messages(&session, &history);
        if titled {
            self.persist_session(&session);
        }
        self.publish(TranscriptUpdate::MessageAppended {
            session_id: session_id.clone(),
            message: user_message,
        });

        let Some(adapter) = self.adapters.get(&session.backend.kind()).cloned() else {
            return Err(EngineError::InvalidState("transport removed".into()));
        };
        info!(backend = ?session.backend.kind(), "stream opened");
        let mut source = adapter
            .open(OpenRequest {
                session: session.clone(),
                history,
                prompt: Prompt { text, attachments },
                cancel,
                tools: self.tools.clone(),
            })
            .await;

        let mut outcome = None;
        while let Some(event) = source.next().await {
            let terminal = self.fold_event(&slot, session_id, event.clone());
            if terminal {
                outcome = Some(outcome_of(event));
                break;
            }
        }
        drop(source);

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                warn!("stream ended without a terminal event");
                let event = StreamEvent::error("stream ended unexpectedly");
                self.fold_event(&slot, session_id, event.clone());
                outcome_of(event)
            }
        };

        let (session, messages) = {
            let mut state = slot.state.lock();
            state.session.touch();
            (state.session.clone(), state.transcript.messages.clone())
        };
        self.persist_messages(&session, &messages);
        self.persist_session(&session);

        info!(
            stop_reason = outcome.stop_reason.as_ref().map(StopReason::as_str),
            error = outcome.error.as_deref(),
            "stream finished"
        );
        self.publish(TranscriptUpdate::StreamFinished {
            session_id: session_id.clone(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    /// Signal the running stream to stop. The adapter's `stop{abort}` flows
    /// through the transcript like any other terminal event. Returns `false`
    /// when the session is idle.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let Some(slot) = self.slot(session_id) else {
            return false;
        };
        let state = slot.state.lock();
        match &state.cancel {
            Some(token) => {
                info!(session_id = %session_id, "cancelling stream");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal every running stream. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let slots: Vec<Arc<SessionSlot>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        slots
            .iter()
            .filter(|slot| {
                let state = slot.state.lock();
                state.cancel.as_ref().map(CancellationToken::cancel).is_some()
            })
            .count()
    }

    /// Apply one event and publish the change. Returns whether it was terminal.
    fn fold_event(&self, slot: &SessionSlot, session_id: &SessionId, event: StreamEvent) -> bool {
        let terminal = event.is_terminal();
        let update = {
            let mut state = slot.state.lock();
            let before = state.transcript.messages.len();
            let touched = state.transcript.active.clone();
            if !state.transcript.apply(event) {
                return terminal;
            }
            let transcript = &state.transcript;
            if transcript.messages.len() > before {
                transcript
                    .last()
                    .cloned()
                    .map(|message| TranscriptUpdate::MessageAppended {
                        session_id: session_id.clone(),
                        message,
                    })
            } else {
                touched
                    .or_else(|| transcript.active.clone())
                    .and_then(|id| transcript.messages.iter().rfind(|m| m.id == id).cloned())
                    .map(|message| TranscriptUpdate::MessageUpdated {
                        session_id: session_id.clone(),
                        message,
                    })
            }
        };
        if let Some(update) = update {
            self.publish(update);
        }
        terminal
    }

    fn persist_messages(&self, session: &Session, messages: &[Message]) {
        if let Err(e) = self
            .store
            .save_messages(&session.server_id, &session.id, messages)
        {
            error!(session_id = %session.id, error = %e, "failed to persist transcript");
        }
    }

    fn persist_session(&self, session: &Session) {
        if let Err(e) = self.store.save_session(session) {
            error!(session_id = %session.id, error = %e, "failed to persist session");
        }
    }
}

fn outcome_of(event: StreamEvent) -> TurnOutcome {
    match event {
        StreamEvent::Stop { reason } => TurnOutcome {
            stop_reason: Some(reason),
            error: None,
        },
        StreamEvent::Error { detail } => TurnOutcome {
            stop_reason: None,
            error: Some(detail),
        },
        _ => TurnOutcome::default(),
    }
}
