//! WebSocket JSON-RPC connection to a remote agent.
//!
//! A single handler task owns the socket. Requests are correlated through a
//! pending map of oneshot senders keyed by request id; notifications are
//! copied into an unbounded queue per subscriber, so a slow reader never
//! loses an update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::{
    self, methods, InitializeParams, NewSessionResponse, PromptResponse, RemoteSessionInfo,
    SessionCancelParams, SessionNewParams, SessionPromptParams, SessionRefParams,
    SessionSetModeParams,
};
use crate::envelope::{self, Envelope, ErrorObject, RequestId};
use crate::error::RpcError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type PendingTx = oneshot::Sender<Result<Value, RpcError>>;

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<InboundNotification>>>>;

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub request_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Notification pushed by the agent.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundNotification {
    pub method: String,
    pub params: Value,
}

enum Outbound {
    Request {
        method: String,
        params: Option<Value>,
        response_tx: PendingTx,
    },
    Notify(Envelope),
}

pub struct AcpConnection {
    cmd_tx: mpsc::Sender<Outbound>,
    subscribers: Subscribers,
    closed: CancellationToken,
    request_timeout: Duration,
    _handler: JoinHandle<()>,
}

impl AcpConnection {
    pub async fn connect(url: &str, config: ConnectionConfig) -> Result<Self, RpcError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| RpcError::Connect(format!("{url}: {e}")))?;
        debug!(url, "acp websocket connected");

        let (cmd_tx, cmd_rx) = mpsc::channel::<Outbound>(64);
        let subscribers = Subscribers::default();
        let closed = CancellationToken::new();
        let handler = tokio::spawn(handler_loop(
            ws,
            cmd_rx,
            subscribers.clone(),
            closed.clone(),
        ));

        Ok(Self {
            cmd_tx,
            subscribers,
            closed,
            request_timeout: config.request_timeout,
            _handler: handler,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Subscribe to agent notifications. Every notification received after
    /// this call is delivered, in arrival order. The receiver yields `None`
    /// once the connection has closed and the queue is drained.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock();
        if !self.closed.is_cancelled() {
            subscribers.push(tx);
        }
        rx
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Outbound::Request {
                method: method.to_string(),
                params,
                response_tx: tx,
            })
            .await
            .map_err(|_| RpcError::Closed)?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => Err(RpcError::Timeout {
                method: method.to_string(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
            Ok(Err(_)) => Err(RpcError::Closed),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.cmd_tx
            .send(Outbound::Notify(Envelope::notification(method, params)))
            .await
            .map_err(|_| RpcError::Closed)
    }

    // ─── ACP methods ─────────────────────────────────────────────────────

    pub async fn initialize(&self, params: &InitializeParams) -> Result<Value, RpcError> {
        self.request(methods::INITIALIZE, Some(acp::to_params(params)))
            .await
    }

    /// Returns the agent-assigned session id.
    pub async fn new_session(&self, params: &SessionNewParams) -> Result<String, RpcError> {
        let result = self
            .request(methods::SESSION_NEW, Some(acp::to_params(params)))
            .await?;
        let parsed: NewSessionResponse =
            serde_json::from_value(result).map_err(|e| RpcError::UnexpectedResult {
                method: methods::SESSION_NEW.into(),
                detail: e.to_string(),
            })?;
        Ok(parsed.session_id)
    }

    pub async fn load_session(&self, params: &SessionRefParams) -> Result<Value, RpcError> {
        self.request(methods::SESSION_LOAD, Some(acp::to_params(params)))
            .await
    }

    pub async fn resume_session(&self, params: &SessionRefParams) -> Result<Value, RpcError> {
        self.request(methods::SESSION_RESUME, Some(acp::to_params(params)))
            .await
    }

    /// Resolves once the agent finishes the turn; progress arrives as
    /// `session/update` notifications in the meantime.
    pub async fn prompt(&self, params: &SessionPromptParams) -> Result<PromptResponse, RpcError> {
        let result = self
            .request(methods::SESSION_PROMPT, Some(acp::to_params(params)))
            .await?;
        if result.is_null() {
            return Ok(PromptResponse::default());
        }
        serde_json::from_value(result).map_err(|e| RpcError::UnexpectedResult {
            method: methods::SESSION_PROMPT.into(),
            detail: e.to_string(),
        })
    }

    /// `session/cancel` is a notification: the agent answers by finishing the
    /// pending prompt request.
    pub async fn cancel(&self, session_id: &str) -> Result<(), RpcError> {
        let params = SessionCancelParams {
            session_id: session_id.to_string(),
        };
        self.notify(methods::SESSION_CANCEL, Some(acp::to_params(&params)))
            .await
    }

    pub async fn list_sessions(&self) -> Result<Vec<RemoteSessionInfo>, RpcError> {
        let result = self.request(methods::SESSION_LIST, None).await?;
        let list = match result {
            Value::Array(_) => result,
            Value::Object(mut obj) => obj.remove("sessions").unwrap_or(Value::Array(Vec::new())),
            _ => Value::Array(Vec::new()),
        };
        serde_json::from_value(list).map_err(|e| RpcError::UnexpectedResult {
            method: methods::SESSION_LIST.into(),
            detail: e.to_string(),
        })
    }

    pub async fn set_mode(&self, params: &SessionSetModeParams) -> Result<Value, RpcError> {
        self.request(methods::SESSION_SET_MODE, Some(acp::to_params(params)))
            .await
    }
}

async fn handler_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<Outbound>,
    subscribers: Subscribers,
    closed: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<RequestId, PendingTx> = HashMap::new();
    let next_id = AtomicU64::new(1);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let envelope = match cmd {
                    Outbound::Request { method, params, response_tx } => {
                        let id = RequestId::from(next_id.fetch_add(1, Ordering::Relaxed));
                        pending.retain(|_, tx| !tx.is_closed());
                        let _ = pending.insert(id.clone(), response_tx);
                        Envelope::request(id, method, params)
                    }
                    Outbound::Notify(envelope) => envelope,
                };
                if ws_tx.send(Message::Text(envelope.encode().into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                match envelope::decode(&text) {
                    Ok(Envelope::Response { id, outcome }) => {
                        if let Some(tx) = pending.remove(&id) {
                            let _ = tx.send(outcome.map_err(RpcError::Remote));
                        } else {
                            debug!(%id, "response for unknown request id");
                        }
                    }
                    Ok(Envelope::Notification { method, params }) => {
                        let notification = InboundNotification {
                            method,
                            params: params.unwrap_or(Value::Null),
                        };
                        subscribers
                            .lock()
                            .retain(|tx| tx.send(notification.clone()).is_ok());
                    }
                    Ok(Envelope::Request { id, method, .. }) => {
                        debug!(%method, "rejecting agent-initiated request");
                        let reply =
                            Envelope::error_response(id, ErrorObject::method_not_found(&method));
                        if ws_tx.send(Message::Text(reply.encode().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed message"),
                }
            }
        }
    }

    {
        let mut subscribers = subscribers.lock();
        closed.cancel();
        subscribers.clear();
    }
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(RpcError::Closed));
    }
    debug!("acp connection handler exited");
}
