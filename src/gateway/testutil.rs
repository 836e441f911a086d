//! In-memory gateway used by session tests. The test plays the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::backoff::BackoffConfig;
use super::shard::{SessionConfig, SessionContext, ShardSession};
use super::transport::{CloseInfo, Connector, Frame, Transport};
use super::types::{IdentifyOptions, SessionState, ShardInfo};
use super::JsonCodec;
use crate::dispatch::EventDispatcher;
use crate::error::TransportError;

pub(crate) struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    failures: Mutex<u32>,
    attempts: Mutex<Vec<Instant>>,
    hang_on_close: Mutex<bool>,
}

impl MockConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            servers,
            failures: Mutex::new(0),
            attempts: Mutex::new(Vec::new()),
            hang_on_close: Mutex::new(false),
        });
        (connector, accepted)
    }

    /// Refuse the next `count` connection attempts.
    pub(crate) fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    /// Transports accepted from now on never finish their close handshake.
    pub(crate) fn hang_on_close(&self) {
        *self.hang_on_close.lock() = true;
    }

    pub(crate) fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.lock().push(Instant::now());
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Other("connection refused".to_string()));
            }
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, to_server) = mpsc::unbounded_channel();
        let closed = Arc::new(Mutex::new(None));
        let _ = self.servers.send(MockServer {
            to_client,
            to_server,
            closed: Arc::clone(&closed),
        });

        Ok(Box::new(MockTransport {
            inbound,
            outbound,
            closed,
            hang_on_close: *self.hang_on_close.lock(),
        }))
    }
}

struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<Mutex<Option<u16>>>,
    hang_on_close: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16) -> Result<(), TransportError> {
        *self.closed.lock() = Some(code);
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Server end of one accepted connection.
pub(crate) struct MockServer {
    to_client: mpsc::UnboundedSender<Frame>,
    to_server: mpsc::UnboundedReceiver<String>,
    closed: Arc<Mutex<Option<u16>>>,
}

impl MockServer {
    pub(crate) fn send(&self, payload: Value) {
        self.raw(&payload.to_string());
    }

    pub(crate) fn raw(&self, text: &str) {
        let _ = self.to_client.send(Frame::Text(text.to_string()));
    }

    pub(crate) fn hello(&self, interval_ms: u64) {
        self.send(json!({ "op": 10, "d": { "heartbeat_interval": interval_ms } }));
    }

    pub(crate) fn ready(&self, session_id: &str, sequence: u64) {
        self.dispatch("READY", sequence, json!({ "v": 10, "session_id": session_id }));
    }

    pub(crate) fn dispatch(&self, name: &str, sequence: u64, data: Value) {
        self.send(json!({ "op": 0, "s": sequence, "t": name, "d": data }));
    }

    pub(crate) fn ack(&self) {
        self.send(json!({ "op": 11 }));
    }

    pub(crate) fn close_with(&self, code: u16) {
        let _ = self.to_client.send(Frame::Close(Some(CloseInfo {
            code,
            reason: String::new(),
        })));
    }

    /// Close code the client sent when it shut this connection down.
    pub(crate) fn client_close_code(&self) -> Option<u16> {
        *self.closed.lock()
    }

    pub(crate) async fn next_payload(&mut self) -> Value {
        let frame = self
            .to_server
            .recv()
            .await
            .expect("client hung up before sending");
        serde_json::from_str(&frame).expect("client sent invalid json")
    }

    pub(crate) async fn expect_op(&mut self, op: u64) -> Value {
        let payload = self.next_payload().await;
        assert_eq!(payload["op"], op, "unexpected payload {payload}");
        payload
    }

    /// Hello, identify, ready: leaves the session connected.
    pub(crate) async fn handshake(&mut self, session: &ShardSession, session_id: &str) -> Value {
        self.hello(45_000);
        let identify = self.expect_op(2).await;
        self.ready(session_id, 1);
        wait_for_state(session, SessionState::Connected).await;
        identify
    }
}

pub(crate) fn test_config() -> SessionConfig {
    SessionConfig {
        gateway_name: Arc::from("test"),
        gateway_url: "wss://gateway.test/?v=10&encoding=json".to_string(),
        backoff: BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_millis(800),
            jitter: 0.0,
        },
        missed_ack_threshold: 2,
    }
}

pub(crate) fn test_context(connector: Arc<MockConnector>, dispatcher: EventDispatcher) -> SessionContext {
    SessionContext {
        config: Arc::new(test_config()),
        connector,
        codec: Arc::new(JsonCodec::new()),
        dispatcher,
    }
}

pub(crate) fn test_session(index: u32, count: u32, context: SessionContext) -> ShardSession {
    ShardSession::new(IdentifyOptions::new(ShardInfo::new(index, count), "token"), context)
}

pub(crate) async fn wait_for_state(session: &ShardSession, state: SessionState) {
    let mut changes = session.state_changes();
    changes
        .wait_for(|current| *current == state)
        .await
        .expect("session state channel closed");
}
