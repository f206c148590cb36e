//! Drives `RemoteAgentAdapter` against an in-process WebSocket agent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parley_core::{
    Backend, NoTools, OpenRequest, Prompt, ServerId, Session, StreamEvent, TransportAdapter,
};
use parley_rpc::acp::ClientInfo;
use parley_rpc::{AcpConnection, ConnectionConfig, RemoteAgentAdapter, RpcError};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

struct AgentSocket {
    ws: WebSocketStream<TcpStream>,
}

impl AgentSocket {
    async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    async fn send(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn expect(&mut self, method: &str) -> Value {
        loop {
            let msg = self.recv().await.expect("client went away");
            if msg["method"] == method {
                return msg;
            }
        }
    }

    async fn reply(&mut self, request: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
            .await;
    }

    async fn update(&mut self, session_id: &str, payload: Value) {
        let mut params = payload;
        params["sessionId"] = json!(session_id);
        self.send(json!({"jsonrpc": "2.0", "method": "session/update", "params": params}))
            .await;
    }

    async fn handshake(&mut self) {
        let init = self.expect("initialize").await;
        assert_eq!(init["params"]["capabilities"]["terminal"], true);
        self.reply(&init, json!({"protocolVersion": 1})).await;
    }
}

async fn spawn_agent<F, Fut>(script: F) -> String
where
    F: FnOnce(AgentSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _ = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        script(AgentSocket { ws }).await;
    });
    format!("ws://{addr}")
}

fn remote_session(server_id: &ServerId) -> Session {
    Session::new(
        server_id.clone(),
        Backend::RemoteAgent {
            remote_session_id: "r1".into(),
        },
    )
}

fn open_request(session: Session, text: &str, cancel: CancellationToken) -> OpenRequest {
    OpenRequest {
        session,
        history: Vec::new(),
        prompt: Prompt {
            text: text.into(),
            attachments: Vec::new(),
        },
        cancel,
        tools: Arc::new(NoTools),
    }
}

fn adapter() -> RemoteAgentAdapter {
    RemoteAgentAdapter::new(ConnectionConfig::default(), ClientInfo::default())
}

#[tokio::test]
async fn prompt_streams_updates_then_stops_with_response_reason() {
    let url = spawn_agent(|mut agent| async move {
        agent.handshake().await;
        let prompt = agent.expect("session/prompt").await;
        assert_eq!(prompt["params"]["sessionId"], "r1");
        assert_eq!(prompt["params"]["text"], "hello");

        agent.update("r1", json!({"text": "Hi "})).await;
        agent.update("someone-else", json!({"text": "noise"})).await;
        agent.update("r1", json!({"kind": "text", "text": "there"})).await;
        agent
            .update("r1", json!({"toolCall": {"name": "search", "input": {"q": "x"}}}))
            .await;
        agent.update("r1", json!({"toolResult": {"result": "R1"}})).await;
        agent.update("r1", json!({"mystery": true})).await;
        agent.reply(&prompt, json!({"stopReason": "end_turn"})).await;
        let _ = agent.recv().await;
    })
    .await;

    let adapter = adapter();
    let server_id = ServerId::from_raw("srv_agent");
    let _ = adapter.connect(&server_id, &url).await.unwrap();

    let events: Vec<StreamEvent> = adapter
        .open(open_request(
            remote_session(&server_id),
            "hello",
            CancellationToken::new(),
        ))
        .await
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            StreamEvent::delta("Hi "),
            StreamEvent::delta("there"),
            StreamEvent::ToolCallStart {
                tool_name: "search".into(),
                input: r#"{"q":"x"}"#.into(),
            },
            StreamEvent::ToolCallEnd {
                tool_name: None,
                result: "R1".into(),
            },
            StreamEvent::stop("end_turn"),
        ]
    );
}

#[tokio::test]
async fn missing_stop_reason_defaults_to_end_turn() {
    let url = spawn_agent(|mut agent| async move {
        agent.handshake().await;
        let prompt = agent.expect("session/prompt").await;
        agent.reply(&prompt, json!({})).await;
        let _ = agent.recv().await;
    })
    .await;

    let adapter = adapter();
    let server_id = ServerId::from_raw("srv_agent");
    let _ = adapter.connect(&server_id, &url).await.unwrap();
    let events: Vec<StreamEvent> = adapter
        .open(open_request(remote_session(&server_id), "x", CancellationToken::new()))
        .await
        .collect()
        .await;
    assert_eq!(events, vec![StreamEvent::stop("end_turn")]);
}

#[tokio::test]
async fn cancel_sends_session_cancel_and_ends_with_single_abort() {
    let (cancel_seen_tx, cancel_seen_rx) = oneshot::channel();
    let url = spawn_agent(|mut agent| async move {
        agent.handshake().await;
        let prompt = agent.expect("session/prompt").await;
        agent.update("r1", json!({"text": "partial"})).await;
        let cancel = agent.expect("session/cancel").await;
        assert!(cancel.get("id").is_none());
        let _ = cancel_seen_tx.send(cancel["params"]["sessionId"].clone());
        agent.reply(&prompt, json!({"stopReason": "cancelled"})).await;
        let _ = agent.recv().await;
    })
    .await;

    let adapter = adapter();
    let server_id = ServerId::from_raw("srv_agent");
    let _ = adapter.connect(&server_id, &url).await.unwrap();

    let cancel = CancellationToken::new();
    let mut source = adapter
        .open(open_request(remote_session(&server_id), "go", cancel.clone()))
        .await;

    assert_eq!(source.next().await, Some(StreamEvent::delta("partial")));
    cancel.cancel();
    assert_eq!(source.next().await, Some(StreamEvent::abort()));
    assert_eq!(source.next().await, None);

    let seen = tokio::time::timeout(Duration::from_secs(5), cancel_seen_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, "r1");
}

#[tokio::test]
async fn agent_initiated_request_gets_method_not_found() {
    let (reply_tx, reply_rx) = oneshot::channel();
    let url = spawn_agent(|mut agent| async move {
        agent.handshake().await;
        agent
            .send(json!({"jsonrpc": "2.0", "id": "req-1", "method": "fs/read_text_file",
                         "params": {"path": "/etc/hosts"}}))
            .await;
        let reply = agent.recv().await.unwrap();
        let _ = reply_tx.send(reply);
        let _ = agent.recv().await;
    })
    .await;

    let adapter = adapter();
    let server_id = ServerId::from_raw("srv_agent");
    let _conn = adapter.connect(&server_id, &url).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), reply_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply["id"], "req-1");
    assert_eq!(reply["error"]["code"], -32601);
    assert!(reply.get("result").is_none());
}

#[tokio::test]
async fn request_times_out_when_agent_is_silent() {
    let url = spawn_agent(|mut agent| async move {
        while agent.recv().await.is_some() {}
    })
    .await;

    let conn = AcpConnection::connect(
        &url,
        ConnectionConfig {
            request_timeout: Duration::from_millis(100),
            ..ConnectionConfig::default()
        },
    )
    .await
    .unwrap();
    let err = conn.request("session/list", None).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));
}

#[tokio::test]
async fn remote_error_response_surfaces_as_error_event() {
    let url = spawn_agent(|mut agent| async move {
        agent.handshake().await;
        let prompt = agent.expect("session/prompt").await;
        agent
            .send(json!({"jsonrpc": "2.0", "id": prompt["id"],
                         "error": {"code": -32000, "message": "session expired"}}))
            .await;
        let _ = agent.recv().await;
    })
    .await;

    let adapter = adapter();
    let server_id = ServerId::from_raw("srv_agent");
    let _ = adapter.connect(&server_id, &url).await.unwrap();
    let events: Vec<StreamEvent> = adapter
        .open(open_request(remote_session(&server_id), "x", CancellationToken::new()))
        .await
        .collect()
        .await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        StreamEvent::Error { detail } if detail.contains("session expired")
    ));
}

#[tokio::test]
async fn dropped_socket_fails_the_turn() {
    let url = spawn_agent(|mut agent| async move {
        agent.handshake().await;
        let _ = agent.expect("session/prompt").await;
        drop(agent);
    })
    .await;

    let adapter = adapter();
    let server_id = ServerId::from_raw("srv_agent");
    let conn = adapter.connect(&server_id, &url).await.unwrap();
    let events: Vec<StreamEvent> = adapter
        .open(open_request(remote_session(&server_id), "x", CancellationToken::new()))
        .await
        .collect()
        .await;
    assert_eq!(events, vec![StreamEvent::error("connection closed")]);
    assert!(conn.is_closed());
}

#[tokio::test]
async fn list_sessions_accepts_wrapped_result() {
    let url = spawn_agent(|mut agent| async move {
        let list = agent.expect("session/list").await;
        agent
            .reply(&list, json!({"sessions": [{"sessionId": "a", "title": "First"}]}))
            .await;
        let _ = agent.recv().await;
    })
    .await;

    let conn = AcpConnection::connect(&url, ConnectionConfig::default())
        .await
        .unwrap();
    let sessions = conn.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, "a");
    assert_eq!(sessions[0].title.as_deref(), Some("First"));
}

#[tokio::test]
async fn slow_consumer_still_receives_every_update() {
    const UPDATES: usize = 1500;
    let url = spawn_agent(|mut agent| async move {
        agent.handshake().await;
        let prompt = agent.expect("session/prompt").await;
        for _ in 0..UPDATES {
            agent.update("r1", json!({"text": "x"})).await;
        }
        agent.reply(&prompt, json!({"stopReason": "end_turn"})).await;
        let _ = agent.recv().await;
    })
    .await;

    let adapter = adapter();
    let server_id = ServerId::from_raw("srv_agent");
    let _ = adapter.connect(&server_id, &url).await.unwrap();
    let mut source = adapter
        .open(open_request(remote_session(&server_id), "flood", CancellationToken::new()))
        .await;

    let mut events = vec![source.next().await.unwrap()];
    tokio::time::sleep(Duration::from_secs(1)).await;
    events.extend(source.collect::<Vec<_>>().await);

    let deltas = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Delta { .. }))
        .count();
    assert_eq!(deltas, UPDATES);
    assert_eq!(events.last(), Some(&StreamEvent::stop("end_turn")));
}

#[tokio::test]
async fn malformed_prompt_result_is_an_error() {
    let url = spawn_agent(|mut agent| async move {
        agent.handshake().await;
        let prompt = agent.expect("session/prompt").await;
        agent.reply(&prompt, json!({"stopReason": 7})).await;
        let _ = agent.recv().await;
    })
    .await;

    let adapter = adapter();
    let server_id = ServerId::from_raw("srv_agent");
    let _ = adapter.connect(&server_id, &url).await.unwrap();
    let events: Vec<StreamEvent> = adapter
        .open(open_request(remote_session(&server_id), "x", CancellationToken::new()))
        .await
        .collect()
        .await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        StreamEvent::Error { detail } if detail.contains("unexpected result for session/prompt")
    ));
}

#[tokio::test]
async fn null_prompt_result_defaults_to_end_turn() {
    let url = spawn_agent(|mut agent| async move {
        agent.handshake().await;
        let prompt = agent.expect("session/prompt").await;
        agent.reply(&prompt, Value::Null).await;
        let _ = agent.recv().await;
    })
    .await;

    let adapter = adapter();
    let server_id = ServerId::from_raw("srv_agent");
    let _ = adapter.connect(&server_id, &url).await.unwrap();
    let events: Vec<StreamEvent> = adapter
        .open(open_request(remote_session(&server_id), "x", CancellationToken::new()))
        .await
        .collect()
        .await;
    assert_eq!(events, vec![StreamEvent::stop("end_turn")]);
}
