use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::{
    error::ApiError,
    protocol::{events, ConnectErrorPayload, Frame},
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The stream ended; carries the peer's reason or the local read error.
    Disconnected { reason: String },
    Domain { event: String, payload: Value },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("credentials rejected: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("request refused by peer: {0}")]
    Refused(ApiError),
}

impl TransportError {
    /// Whether the failure concerns the link rather than the individual request.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Protocol(_) | Self::NotConnected
        )
    }
}

/// Persistent event-stream connection to the sync peer.
///
/// `connect` resolves once the handshake completes and hands back the stream
/// of inbound events; `send` resolves with the peer's acknowledgment payload.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, token: &str) -> Result<TransportEvents, TransportError>;
    async fn send(&self, event: &str, payload: Value) -> Result<Value, TransportError>;
    async fn disconnect(&self);
}

type AckWaiter = oneshot::Sender<Result<Value, ApiError>>;

/// Ack waiters of one socket. Once the reader exits the table is closed and
/// no new waiter can be registered on it.
#[derive(Default)]
struct AckTable {
    waiters: HashMap<u64, AckWaiter>,
    closed: bool,
}

type PendingAcks = Arc<Mutex<AckTable>>;

struct ActiveSocket {
    outgoing: mpsc::UnboundedSender<WsMessage>,
    pending_acks: PendingAcks,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ActiveSocket {
    fn shutdown(self) {
        let _ = self.outgoing.send(WsMessage::Close(None));
        self.reader.abort();
        // The writer exits on its own once the close frame is flushed and the
        // sender side is dropped.
        drop(self.outgoing);
        let writer = self.writer;
        tokio::spawn(async move {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
        });
    }
}

/// JSON-over-WebSocket transport.
pub struct WebSocketTransport {
    url: String,
    active: Mutex<Option<ActiveSocket>>,
    next_ack_id: AtomicU64,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            active: Mutex::new(None),
            next_ack_id: AtomicU64::new(1),
        }
    }

    fn endpoint_with_token(&self, token: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.url)
            .map_err(|err| TransportError::Protocol(format!("invalid websocket url: {err}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::Protocol(format!(
                    "websocket url must use ws:// or wss://, got {other}://"
                )))
            }
        }
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

fn map_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error;

    match err {
        Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                TransportError::Rejected(format!("websocket upgrade refused with status {status}"))
            } else {
                TransportError::Network(format!("websocket upgrade failed with status {status}"))
            }
        }
        other => TransportError::Network(other.to_string()),
    }
}

fn handshake_result(frame: Frame) -> Result<(), TransportError> {
    match frame.event.as_str() {
        events::CONNECT => Ok(()),
        events::CONNECT_ERROR => {
            let payload: ConnectErrorPayload =
                serde_json::from_value(frame.payload).unwrap_or(ConnectErrorPayload {
                    message: "connection refused".into(),
                    error: None,
                });
            let error = frame.error.or(payload.error);
            match error {
                Some(api) if api.code.is_auth_rejection() => {
                    Err(TransportError::Rejected(api.message))
                }
                Some(api) => Err(TransportError::Protocol(api.message)),
                None => Err(TransportError::Protocol(payload.message)),
            }
        }
        other => Err(TransportError::Protocol(format!(
            "expected handshake frame, got '{other}'"
        ))),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, token: &str) -> Result<TransportEvents, TransportError> {
        if let Some(previous) = self.active.lock().await.take() {
            previous.shutdown();
        }

        let url = self.endpoint_with_token(token)?;
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(map_connect_error)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        loop {
            match ws_reader.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame: Frame = serde_json::from_str(&text).map_err(|err| {
                        TransportError::Protocol(format!("invalid handshake frame: {err}"))
                    })?;
                    handshake_result(frame)?;
                    break;
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(TransportError::Network(
                        "connection closed during handshake".into(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(TransportError::Network(err.to_string())),
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WsMessage>();
        let pending_acks: PendingAcks = Arc::new(Mutex::new(AckTable::default()));

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, WsMessage::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader_acks = Arc::clone(&pending_acks);
        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        let frame: Frame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(error = %err, "transport: ignoring undecodable frame");
                                continue;
                            }
                        };
                        if frame.event == events::ACK {
                            let Some(ack_id) = frame.ack_id else {
                                warn!("transport: ack frame without ack id");
                                continue;
                            };
                            if let Some(waiter) = reader_acks.lock().await.waiters.remove(&ack_id) {
                                let result = match frame.error {
                                    Some(error) => Err(error),
                                    None => Ok(frame.payload),
                                };
                                let _ = waiter.send(result);
                            }
                        } else if frame.event == events::DISCONNECT {
                            break frame
                                .payload
                                .get("reason")
                                .and_then(Value::as_str)
                                .unwrap_or("server closed the session")
                                .to_string();
                        } else {
                            let _ = events_tx.send(TransportEvent::Domain {
                                event: frame.event,
                                payload: frame.payload,
                            });
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "websocket closed".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break format!("websocket receive failed: {err}"),
                    None => break "websocket stream ended".into(),
                }
            };
            // Dropping the waiters resolves in-flight sends with NotConnected.
            {
                let mut acks = reader_acks.lock().await;
                acks.closed = true;
                acks.waiters.clear();
            }
            debug!(%reason, "transport: event stream ended");
            let _ = events_tx.send(TransportEvent::Disconnected { reason });
        });

        *self.active.lock().await = Some(ActiveSocket {
            outgoing: outgoing_tx,
            pending_acks,
            reader,
            writer,
        });
        info!(url = %self.url, "transport: websocket handshake completed");
        Ok(events_rx)
    }

    async fn send(&self, event: &str, payload: Value) -> Result<Value, TransportError> {
        let (outgoing, pending_acks) = {
            let guard = self.active.lock().await;
            let active = guard.as_ref().ok_or(TransportError::NotConnected)?;
            (active.outgoing.clone(), Arc::clone(&active.pending_acks))
        };

        let ack_id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut acks = pending_acks.lock().await;
            if acks.closed {
                return Err(TransportError::NotConnected);
            }
            acks.waiters.insert(ack_id, ack_tx);
        }

        let text = serde_json::to_string(&Frame::request(event, payload, ack_id))
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        if outgoing.send(WsMessage::Text(text)).is_err() {
            pending_acks.lock().await.waiters.remove(&ack_id);
            return Err(TransportError::NotConnected);
        }

        match ack_rx.await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(error)) => Err(TransportError::Refused(error)),
            Err(_) => Err(TransportError::NotConnected),
        }
    }

    async fn disconnect(&self) {
        if let Some(active) = self.active.lock().await.take() {
            active.shutdown();
            info!(url = %self.url, "transport: websocket disconnected");
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
