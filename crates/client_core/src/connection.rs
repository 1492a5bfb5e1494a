use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::{
    config::SyncConfig,
    error::SyncError,
    lock,
    scheduler::{backoff_delay, ScheduledTask},
    transport::{Transport, TransportError, TransportEvent, TransportEvents},
    types::{ConnectionSnapshot, ConnectionState},
};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl From<&SyncConfig> for ConnectionSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            reconnect_base_delay: config.reconnect_base_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

/// What the manager reports to whoever drives the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionSnapshot),
    /// Emitted on every transition into `connected`, after the state change.
    Connected,
    Inbound { event: String, payload: Value },
}

struct ConnectionInner {
    snapshot: ConnectionSnapshot,
    credentials: Option<Credentials>,
    /// Bumped by every explicit connect/disconnect so stale tasks can tell
    /// they no longer own the connection.
    generation: u64,
    pump: Option<ScheduledTask>,
    reconnect: Option<ScheduledTask>,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    inner: Mutex<ConnectionInner>,
    snapshots: watch::Sender<ConnectionSnapshot>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (snapshots, _) = watch::channel(ConnectionSnapshot::default());
        let manager = Arc::new(Self {
            transport,
            settings,
            inner: Mutex::new(ConnectionInner {
                snapshot: ConnectionSnapshot::default(),
                credentials: None,
                generation: 0,
                pump: None,
                reconnect: None,
            }),
            snapshots,
            events,
        });
        (manager, events_rx)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        lock(&self.inner).snapshot.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner).snapshot.state == ConnectionState::Connected
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Establishes the connection, resolving once the handshake completes.
    ///
    /// Any reconnect cycle in progress is cancelled first. Failures are
    /// returned to the caller; a rejected credential ends there, anything
    /// else also starts the backoff loop.
    pub async fn connect(self: &Arc<Self>, credentials: Credentials) -> Result<(), SyncError> {
        let generation = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.reconnect = None;
            inner.pump = None;
            inner.credentials = Some(credentials.clone());
            self.transition(&mut inner, ConnectionState::Connecting, 0, None);
            inner.generation
        };

        match self.handshake(&credentials).await {
            Ok(stream) => {
                self.on_connected(generation, stream);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "connection: connect failed");
                let mut inner = lock(&self.inner);
                if inner.generation == generation {
                    if matches!(err, TransportError::Rejected(_)) {
                        self.transition(
                            &mut inner,
                            ConnectionState::Disconnected,
                            0,
                            Some(err.to_string()),
                        );
                    } else {
                        self.schedule_reconnect(&mut inner, generation, err.to_string());
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Tears the connection down; no automatic reconnect follows.
    pub async fn disconnect(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.reconnect = None;
            inner.pump = None;
            self.transition(&mut inner, ConnectionState::Disconnected, 0, None);
        }
        self.transport.disconnect().await;
    }

    async fn handshake(&self, credentials: &Credentials) -> Result<TransportEvents, TransportError> {
        match tokio::time::timeout(
            self.settings.handshake_timeout,
            self.transport.connect(&credentials.token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout("handshake".into())),
        }
    }

    fn transition(
        &self,
        inner: &mut ConnectionInner,
        state: ConnectionState,
        attempt_count: u32,
        last_error: Option<String>,
    ) {
        let snapshot = ConnectionSnapshot {
            state,
            attempt_count,
            last_error,
        };
        if inner.snapshot == snapshot {
            return;
        }
        info!(
            state = ?snapshot.state,
            attempt = snapshot.attempt_count,
            last_error = snapshot.last_error.as_deref().unwrap_or(""),
            "connection: state changed"
        );
        inner.snapshot = snapshot.clone();
        self.snapshots.send_replace(snapshot.clone());
        let _ = self.events.send(ConnectionEvent::StateChanged(snapshot));
    }

    fn on_connected(self: &Arc<Self>, generation: u64, stream: TransportEvents) {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return;
        }
        self.transition(&mut inner, ConnectionState::Connected, 0, None);

        let manager = Arc::clone(self);
        inner.pump = Some(ScheduledTask::spawn(async move {
            manager.pump(generation, stream).await;
        }));
        let _ = self.events.send(ConnectionEvent::Connected);
    }

    async fn pump(self: Arc<Self>, generation: u64, mut stream: TransportEvents) {
        while let Some(event) = stream.recv().await {
            match event {
                TransportEvent::Domain { event, payload } => {
                    if lock(&self.inner).generation != generation {
                        return;
                    }
                    let _ = self.events.send(ConnectionEvent::Inbound { event, payload });
                }
                TransportEvent::Disconnected { reason } => {
                    self.on_transport_lost(generation, reason);
                    return;
                }
            }
        }
        self.on_transport_lost(generation, "event stream closed".into());
    }

    fn on_transport_lost(self: &Arc<Self>, generation: u64, reason: String) {
        let mut inner = lock(&self.inner);
        if inner.generation != generation || inner.snapshot.state != ConnectionState::Connected {
            return;
        }
        warn!(%reason, "connection: transport lost, scheduling reconnect");
        // Called from inside the pump, which returns without yielding again,
        // so releasing its handle here cannot cut it short.
        inner.pump = None;
        self.schedule_reconnect(&mut inner, generation, reason);
    }

    fn schedule_reconnect(
        self: &Arc<Self>,
        inner: &mut ConnectionInner,
        generation: u64,
        reason: String,
    ) {
        self.transition(inner, ConnectionState::Reconnecting, 0, Some(reason));
        let manager = Arc::clone(self);
        inner.reconnect = Some(ScheduledTask::spawn(async move {
            manager.reconnect_loop(generation).await;
        }));
    }

    async fn reconnect_loop(self: Arc<Self>, generation: u64) {
        let Some(credentials) = lock(&self.inner).credentials.clone() else {
            return;
        };
        let max_attempts = self.settings.max_reconnect_attempts;
        let mut last_error = String::from("no reconnect attempts allowed");

        for attempt in 1..=max_attempts {
            tokio::time::sleep(backoff_delay(
                self.settings.reconnect_base_delay,
                attempt - 1,
            ))
            .await;

            {
                let mut inner = lock(&self.inner);
                if inner.generation != generation {
                    return;
                }
                let previous_error = inner.snapshot.last_error.clone();
                self.transition(
                    &mut inner,
                    ConnectionState::Reconnecting,
                    attempt,
                    previous_error,
                );
            }

            match self.handshake(&credentials).await {
                Ok(stream) => {
                    info!(attempt, "connection: reconnected");
                    self.on_connected(generation, stream);
                    return;
                }
                Err(TransportError::Rejected(message)) => {
                    let mut inner = lock(&self.inner);
                    if inner.generation == generation {
                        self.transition(
                            &mut inner,
                            ConnectionState::Disconnected,
                            attempt,
                            Some(format!("authentication rejected: {message}")),
                        );
                    }
                    warn!(attempt, "connection: credentials rejected during reconnect");
                    return;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "connection: reconnect attempt failed");
                    last_error = err.to_string();
                    let mut inner = lock(&self.inner);
                    if inner.generation != generation {
                        return;
                    }
                    self.transition(
                        &mut inner,
                        ConnectionState::Reconnecting,
                        attempt,
                        Some(last_error.clone()),
                    );
                }
            }
        }

        let mut inner = lock(&self.inner);
        if inner.generation == generation {
            warn!(max_attempts, "connection: reconnect attempts exhausted");
            self.transition(
                &mut inner,
                ConnectionState::Disconnected,
                max_attempts,
                Some(format!(
                    "gave up after {max_attempts} reconnect attempts: {last_error}"
                )),
            );
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
