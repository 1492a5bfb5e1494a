//! In-memory transport whose handshakes and acknowledgments are scripted by
//! the test.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::events,
};
use tokio::sync::mpsc;

use crate::{
    lock,
    transport::{Transport, TransportError, TransportEvent, TransportEvents},
};

#[derive(Debug, Clone)]
pub enum ConnectScript {
    Accept,
    Fail(TransportError),
    /// Never completes the handshake.
    Hang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Ack,
    Refuse,
    /// Never acknowledges.
    Silent,
    /// Fails as if the link dropped mid-request.
    DropLink,
}

#[derive(Default)]
struct ScriptState {
    connect_script: VecDeque<ConnectScript>,
    stream: Option<mpsc::UnboundedSender<TransportEvent>>,
    sent: Vec<(String, Value)>,
    ack_ids: VecDeque<String>,
    next_id: u64,
    send_mode: Option<SendMode>,
    ack_body: Option<Value>,
}

#[derive(Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
    connects: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues handshake outcomes; once exhausted every connect is accepted.
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = ConnectScript>) {
        lock(&self.state).connect_script.extend(outcomes);
    }

    /// Server ids handed out by successive `send-message` acks.
    pub fn script_ack_ids<'a>(&self, ids: impl IntoIterator<Item = &'a str>) {
        lock(&self.state)
            .ack_ids
            .extend(ids.into_iter().map(str::to_string));
    }

    /// Replaces every `send-message` ack with `body`, verbatim.
    pub fn set_ack_body(&self, body: Value) {
        lock(&self.state).ack_body = Some(body);
    }

    pub fn set_send_mode(&self, mode: SendMode) {
        lock(&self.state).send_mode = Some(mode);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).stream.is_some()
    }

    /// Pushes a domain event over the open stream.
    pub fn emit(&self, event: &str, payload: Value) {
        if let Some(stream) = lock(&self.state).stream.as_ref() {
            let _ = stream.send(TransportEvent::Domain {
                event: event.to_string(),
                payload,
            });
        }
    }

    /// Simulates the peer dropping the link.
    pub fn drop_connection(&self, reason: &str) {
        if let Some(stream) = lock(&self.state).stream.take() {
            let _ = stream.send(TransportEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    pub fn sent_events(&self, event: &str) -> Vec<Value> {
        lock(&self.state)
            .sent
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _token: &str) -> Result<TransportEvents, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = lock(&self.state)
            .connect_script
            .pop_front()
            .unwrap_or(ConnectScript::Accept);
        match script {
            ConnectScript::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                lock(&self.state).stream = Some(tx);
                Ok(rx)
            }
            ConnectScript::Fail(err) => Err(err),
            ConnectScript::Hang => std::future::pending().await,
        }
    }

    async fn send(&self, event: &str, payload: Value) -> Result<Value, TransportError> {
        let mode = {
            let mut state = lock(&self.state);
            if state.stream.is_none() {
                return Err(TransportError::NotConnected);
            }
            state.sent.push((event.to_string(), payload.clone()));
            state.send_mode.unwrap_or(SendMode::Ack)
        };
        if event != events::SEND_MESSAGE {
            return Ok(Value::Null);
        }

        match mode {
            SendMode::Ack => {
                let id = {
                    let mut state = lock(&self.state);
                    if let Some(body) = state.ack_body.clone() {
                        return Ok(body);
                    }
                    state.next_id += 1;
                    let fallback = format!("M{}", state.next_id);
                    state.ack_ids.pop_front().unwrap_or(fallback)
                };
                let mut ack = payload;
                ack["id"] = json!(id);
                Ok(ack)
            }
            SendMode::Refuse => Err(TransportError::Refused(ApiError::new(
                ErrorCode::Validation,
                "message rejected",
            ))),
            SendMode::Silent => std::future::pending().await,
            SendMode::DropLink => Err(TransportError::NotConnected),
        }
    }

    async fn disconnect(&self) {
        lock(&self.state).stream.take();
    }
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Awaits `future`, failing the test after two seconds.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("operation timed out")
}
