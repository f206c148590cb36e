//! Remote-agent transport: one `session/prompt` request per turn, progress
//! consumed from `session/update` notifications.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parley_core::{
    Backend, BackendKind, EventSource, OpenRequest, ServerId, StopReason, StreamEvent,
    TransportAdapter,
};
use tracing::{debug, info, warn};

use crate::acp::{
    methods, ClientInfo, ImageParam, InitializeParams, PromptResponse, SessionPromptParams,
};
use crate::connection::{AcpConnection, ConnectionConfig, InboundNotification};
use crate::error::RpcError;
use crate::notification::{classify_update, session_id_of};

pub struct RemoteAgentAdapter {
    connections: DashMap<ServerId, Arc<AcpConnection>>,
    config: ConnectionConfig,
    client_info: ClientInfo,
}

impl RemoteAgentAdapter {
    pub fn new(config: ConnectionConfig, client_info: ClientInfo) -> Self {
        Self {
            connections: DashMap::new(),
            config,
            client_info,
        }
    }

    /// Open a WebSocket to `url`, run `initialize` and bind the connection to
    /// `server_id`, replacing any previous one.
    pub async fn connect(
        &self,
        server_id: &ServerId,
        url: &str,
    ) -> Result<Arc<AcpConnection>, RpcError> {
        let conn = Arc::new(AcpConnection::connect(url, self.config.clone()).await?);
        let params = InitializeParams {
            client_info: self.client_info.clone(),
            ..InitializeParams::default()
        };
        let _ = conn.initialize(&params).await?;
        info!(server_id = %server_id, url, "remote agent connected");
        self.register(server_id.clone(), conn.clone());
        Ok(conn)
    }

    pub fn register(&self, server_id: ServerId, conn: Arc<AcpConnection>) {
        let _ = self.connections.insert(server_id, conn);
    }

    pub fn connection(&self, server_id: &ServerId) -> Option<Arc<AcpConnection>> {
        self.connections.get(server_id).map(|c| c.value().clone())
    }

    pub fn disconnect(&self, server_id: &ServerId) -> bool {
        self.connections.remove(server_id).is_some()
    }
}

enum Next {
    Cancelled,
    Update(Option<InboundNotification>),
    Finished(Result<PromptResponse, RpcError>),
}

#[async_trait]
impl TransportAdapter for RemoteAgentAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteAgent
    }

    async fn open(&self, request: OpenRequest) -> EventSource {
        let OpenRequest {
            session,
            prompt,
            cancel,
            ..
        } = request;

        let Backend::RemoteAgent { remote_session_id } = session.backend else {
            return single(StreamEvent::error("session is not bound to a remote agent"));
        };
        let Some(conn) = self.connection(&session.server_id) else {
            return single(StreamEvent::error(format!(
                "no agent connection for server {}",
                session.server_id
            )));
        };

        let mut params = SessionPromptParams::new(remote_session_id.clone(), prompt.text);
        params.images = prompt
            .attachments
            .into_iter()
            .filter(|a| a.is_image())
            .map(|a| ImageParam {
                data: a.data,
                mime_type: a.mime_type,
            })
            .collect();

        Box::pin(async_stream::stream! {
            if cancel.is_cancelled() {
                yield StreamEvent::abort();
                return;
            }

            // Subscribe before sending so no update can slip past.
            let mut updates = conn.subscribe();
            let pending = conn.prompt(&params);
            tokio::pin!(pending);
            // After the socket closes only the prompt outcome is left to wait for.
            let mut updates_open = true;
            debug!(remote_session_id = %remote_session_id, "session/prompt sent");

            loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Next::Cancelled,
                    update = updates.recv(), if updates_open => Next::Update(update),
                    outcome = &mut pending => Next::Finished(outcome),
                };

                match next {
                    Next::Cancelled => {
                        if let Err(e) = conn.cancel(&remote_session_id).await {
                            warn!(error = %e, "failed to send session/cancel");
                        }
                        yield StreamEvent::abort();
                        return;
                    }
                    Next::Update(Some(notification)) => {
                        for event in events_for(&notification, &remote_session_id) {
                            let terminal = event.is_terminal();
                            yield event;
                            if terminal {
                                return;
                            }
                        }
                    }
                    Next::Update(None) => updates_open = false,
                    Next::Finished(outcome) => {
                        // Updates that raced the response are already queued.
                        while let Ok(notification) = updates.try_recv() {
                            for event in events_for(&notification, &remote_session_id) {
                                let terminal = event.is_terminal();
                                yield event;
                                if terminal {
                                    return;
                                }
                            }
                        }
                        match outcome {
                            Ok(response) => {
                                let reason = response
                                    .stop_reason
                                    .unwrap_or_else(|| StopReason::END_TURN.to_string());
                                yield StreamEvent::stop(reason);
                            }
                            Err(e) => {
                                yield StreamEvent::error(e.to_string());
                            }
                        }
                        return;
                    }
                }
            }
        })
    }
}

fn events_for(notification: &InboundNotification, remote_session_id: &str) -> Vec<StreamEvent> {
    if notification.method != methods::SESSION_UPDATE {
        return Vec::new();
    }
    match session_id_of(&notification.params) {
        Some(id) if id != remote_session_id => Vec::new(),
        _ => classify_update(&notification.params),
    }
}

fn single(event: StreamEvent) -> EventSource {
    Box::pin(futures::stream::once(async move { event }))
}
