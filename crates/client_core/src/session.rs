use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use chrono::Utc;
use serde_json::Value;
use shared::{
    domain::{Attachment, LocalId, MessageId, ThreadId, UserId},
    protocol::{events, DomainEventKind, SendMessageRequest, ThreadMembershipRequest},
};
use storage::KeyValueStore;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

use crate::{
    cache::MessageCache,
    config::SyncConfig,
    connection::{ConnectionEvent, ConnectionManager, Credentials},
    error::{SendError, SyncError},
    fetch::{fetch_thread_messages, fetch_thread_summaries, BulkFetcher, MissingBulkFetcher},
    lock,
    normalize::{normalize, normalize_thread_summary},
    notifications::{classify_notification, HandlerId, NotificationRouter, PersistentHandler},
    queue::{FlushStep, OutboundQueue},
    registry::{Incoming, ThreadHandler, ThreadSubscriptionRegistry},
    scheduler::ScheduledTask,
    store::{InsertOutcome, MessageStore, ReconcileOutcome},
    transport::Transport,
    types::{
        ConnectionState, ConnectionStatus, EventCategory, Message, OutboundQueueEntry,
        PersistentEvent, SyncEvent, Thread, ThreadEvent,
    },
};

const EVENT_CAPACITY: usize = 256;

enum Command {
    Transmit(OutboundQueueEntry),
    Join(ThreadId),
    Leave(ThreadId),
    Merge {
        thread_id: ThreadId,
        messages: Vec<Message>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// State shared between the public handle, the driver task and the
/// background fetch tasks.
struct SessionShared {
    config: SyncConfig,
    user_id: UserId,
    connection: Arc<ConnectionManager>,
    registry: ThreadSubscriptionRegistry,
    router: NotificationRouter,
    store: Mutex<MessageStore>,
    cache: MessageCache,
    kv: Arc<dyn KeyValueStore>,
    fetcher: Arc<dyn BulkFetcher>,
    bulk_fetch_enabled: bool,
    queued: Arc<AtomicUsize>,
    events: broadcast::Sender<SyncEvent>,
    status: watch::Sender<ConnectionStatus>,
}

/// One signed-in user's sync engine.
///
/// Built by [`SyncSession::start`] and torn down by [`SyncSession::shutdown`].
/// A single driver task applies connection events, inbound events and
/// outbound sends one at a time; the public methods only record intent and
/// never wait on the network, except `connect` and the bulk loads.
pub struct SyncSession {
    shared: Arc<SessionShared>,
    commands: mpsc::UnboundedSender<Command>,
    driver: Mutex<Option<ScheduledTask>>,
    poller: Mutex<Option<ScheduledTask>>,
    closed: AtomicBool,
}

impl SyncSession {
    pub async fn start(
        config: SyncConfig,
        user_id: UserId,
        transport: Arc<dyn Transport>,
        fetcher: Option<Arc<dyn BulkFetcher>>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Result<Self, SyncError> {
        let queue = OutboundQueue::load(&user_id, Arc::clone(&kv))
            .await
            .map_err(SyncError::Storage)?;

        let mut store = MessageStore::new(user_id.clone(), config.dedup_window);
        let restored = store.restore_pending(&queue.snapshot());

        let (connection, connection_events) =
            ConnectionManager::new(transport, (&config).into());
        let queued = queue.depth();
        let (status, _) = watch::channel(ConnectionStatus::from_snapshot(
            &connection.snapshot(),
            queue.len(),
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let bulk_fetch_enabled = fetcher.is_some();
        let shared = Arc::new(SessionShared {
            user_id: user_id.clone(),
            connection,
            registry: ThreadSubscriptionRegistry::new(),
            router: NotificationRouter::new(),
            store: Mutex::new(store),
            cache: MessageCache::new(Arc::clone(&kv)),
            kv,
            fetcher: fetcher.unwrap_or_else(|| Arc::new(MissingBulkFetcher)),
            bulk_fetch_enabled,
            queued,
            events,
            status,
            config,
        });

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            shared: Arc::clone(&shared),
            queue,
            connection_events,
            commands: commands_rx,
            command_handle: commands.downgrade(),
            refresh: None,
        };
        let driver = ScheduledTask::spawn(driver.run());

        let poller = match shared.config.poll_interval {
            Some(interval) if shared.bulk_fetch_enabled => {
                let shared = Arc::clone(&shared);
                let command_handle = commands.downgrade();
                Some(ScheduledTask::repeating(interval, move || {
                    let shared = Arc::clone(&shared);
                    let command_handle = command_handle.clone();
                    async move {
                        if !shared.connection.is_connected() {
                            shared.refresh_tracked(&command_handle).await;
                        }
                    }
                }))
            }
            _ => None,
        };

        info!(user_id = %user_id, restored, "session: started");
        Ok(Self {
            shared,
            commands,
            driver: Mutex::new(Some(driver)),
            poller: Mutex::new(poller),
            closed: AtomicBool::new(false),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.shared.user_id
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SyncError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Resolves once the handshake completes. Rejoining tracked threads and
    /// flushing the outbound queue follow on the driver task.
    pub async fn connect(&self, credentials: Credentials) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.shared.connection.connect(credentials).await
    }

    pub async fn disconnect(&self) {
        self.shared.connection.disconnect().await;
    }

    /// Routes events for `thread_id` to `handler`, replacing any earlier one.
    /// Joining happens now if connected, otherwise on the next connect.
    pub fn subscribe(&self, thread_id: ThreadId, handler: ThreadHandler) {
        self.shared.registry.subscribe(thread_id.clone(), handler);
        if self.shared.connection.is_connected() {
            let _ = self.commands.send(Command::Join(thread_id));
        }
    }

    pub fn unsubscribe(&self, thread_id: &ThreadId) {
        let removed = self.shared.registry.unsubscribe(thread_id);
        if removed && self.shared.connection.is_connected() {
            let _ = self.commands.send(Command::Leave(thread_id.clone()));
        }
    }

    /// Stores the optimistic copy and hands the message to the driver,
    /// which transmits it or queues it until the next connect.
    pub fn send(
        &self,
        thread_id: ThreadId,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
        reply_to_id: Option<MessageId>,
    ) -> Result<Message, SyncError> {
        self.ensure_open()?;
        let content = content.into();
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let entry = OutboundQueueEntry::new(SendMessageRequest {
            thread_id,
            local_id: LocalId::generate(),
            content,
            attachments,
            reply_to_id,
        });
        let message = Message::from_request(
            &entry.request,
            self.shared.user_id.clone(),
            entry.enqueued_at,
        );

        lock(&self.shared.store).create_optimistic(message.clone());
        self.shared
            .notify_thread(&message.thread_id, ThreadEvent::MessageAdded(message.clone()));
        self.commands
            .send(Command::Transmit(entry))
            .map_err(|_| SyncError::SessionClosed)?;
        Ok(message)
    }

    pub fn register_persistent_handler(
        &self,
        category: EventCategory,
        handler: PersistentHandler,
    ) -> HandlerId {
        self.shared.router.register(category, handler)
    }

    pub fn unregister_persistent_handler(&self, id: HandlerId) -> bool {
        self.shared.router.unregister(id)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.current_status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn status_stream(&self) -> WatchStream<ConnectionStatus> {
        WatchStream::new(self.watch_status())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_subscribed(&self, thread_id: &ThreadId) -> bool {
        self.shared.registry.is_subscribed(thread_id)
    }

    pub fn is_joined(&self, thread_id: &ThreadId) -> bool {
        self.shared.registry.is_joined(thread_id)
    }

    pub fn messages(&self, thread_id: &ThreadId) -> Vec<Message> {
        lock(&self.shared.store).messages(thread_id)
    }

    pub fn thread(&self, thread_id: &ThreadId) -> Option<Thread> {
        lock(&self.shared.store).thread(thread_id)
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        lock(&self.shared.store).thread_ids()
    }

    pub fn queued_count(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn mark_read(&self, thread_id: &ThreadId) {
        lock(&self.shared.store).mark_read(thread_id, &self.shared.user_id);
    }

    /// Fetches the thread list and records participants and unread counts.
    pub async fn load_threads(&self) -> Result<Vec<ThreadId>, SyncError> {
        self.ensure_open()?;
        let items = fetch_thread_summaries(self.shared.fetcher.as_ref())
            .await
            .map_err(SyncError::Fetch)?;
        let now = Utc::now();
        let mut loaded = Vec::with_capacity(items.len());
        {
            let mut store = lock(&self.shared.store);
            for item in &items {
                match normalize_thread_summary(item, now) {
                    Ok(summary) => {
                        loaded.push(summary.id.clone());
                        store.upsert_thread_summary(summary);
                    }
                    Err(err) => warn!(error = %err, "session: skipping malformed thread summary"),
                }
            }
        }
        info!(threads = loaded.len(), "session: thread list loaded");
        let _ = self
            .shared
            .events
            .send(SyncEvent::ThreadsLoaded(loaded.clone()));
        Ok(loaded)
    }

    /// Paints the thread from the local cache, then merges the newest page
    /// from the bulk-fetch endpoint. Cached messages stay merged even when
    /// the fetch fails.
    pub async fn load_thread(&self, thread_id: &ThreadId) -> Result<Vec<Message>, SyncError> {
        self.ensure_open()?;
        match self.shared.cache.load(thread_id).await {
            Ok(cached) if !cached.is_empty() => {
                let merged = lock(&self.shared.store).merge_batch(thread_id, cached);
                debug!(thread_id = %thread_id, merged = merged.len(), "session: cache rehydrated");
            }
            Ok(_) => {}
            Err(err) => warn!(thread_id = %thread_id, error = %err, "session: message cache unreadable"),
        }

        let fetched = self
            .shared
            .fetch_history(thread_id)
            .await
            .map_err(SyncError::Fetch)?;
        lock(&self.shared.store).merge_batch(thread_id, fetched);
        self.shared.persist_thread(thread_id).await;
        Ok(self.messages(thread_id))
    }

    /// Tears the session down: drops the connection, clears the outbound
    /// queue and its persisted copy, and releases every handler.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.poller).take();
        self.shared.connection.disconnect().await;

        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        } else {
            let key = OutboundQueue::storage_key(&self.shared.user_id);
            if let Err(err) = self.shared.kv.remove(&key).await {
                warn!(error = %err, "session: failed to clear outbound queue");
            }
        }
        lock(&self.driver).take();

        self.shared.registry.clear();
        self.shared.router.clear();
        info!(user_id = %self.shared.user_id, "session: shut down");
    }
}

impl SessionShared {
    fn current_status(&self) -> ConnectionStatus {
        ConnectionStatus::from_snapshot(
            &self.connection.snapshot(),
            self.queued.load(Ordering::SeqCst),
        )
    }

    fn publish_status(&self) {
        let status = self.current_status();
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if changed {
            let _ = self.events.send(SyncEvent::StatusChanged(status));
        }
    }

    fn notify_thread(&self, thread_id: &ThreadId, event: ThreadEvent) {
        self.registry.dispatch(
            &Incoming {
                thread_id: thread_id.clone(),
                thread_event: Some(event),
                persistent: None,
            },
            &self.router,
        );
    }

    async fn persist_thread(&self, thread_id: &ThreadId) {
        let messages = lock(&self.store).messages(thread_id);
        if let Err(err) = self.cache.save(thread_id, &messages).await {
            warn!(thread_id = %thread_id, error = %err, "session: failed to cache messages");
        }
    }

    async fn fetch_history(&self, thread_id: &ThreadId) -> anyhow::Result<Vec<Message>> {
        let items = fetch_thread_messages(
            self.fetcher.as_ref(),
            thread_id,
            self.config.history_page_size,
        )
        .await?;
        let now = Utc::now();
        Ok(items
            .iter()
            .filter_map(|item| {
                // History items frequently omit the thread id they belong to.
                let mut item = item.clone();
                if let Value::Object(fields) = &mut item {
                    fields
                        .entry("threadId")
                        .or_insert_with(|| Value::String(thread_id.to_string()));
                }
                normalize(&item, now)
                    .map_err(|err| warn!(error = %err, "session: skipping malformed history item"))
                    .ok()
            })
            .collect())
    }

    /// Fetches every tracked thread and hands the results to the driver.
    async fn refresh_tracked(&self, commands: &mpsc::WeakUnboundedSender<Command>) {
        for thread_id in self.registry.tracked_threads() {
            match self.fetch_history(&thread_id).await {
                Ok(messages) => {
                    let Some(commands) = commands.upgrade() else {
                        return;
                    };
                    let _ = commands.send(Command::Merge {
                        thread_id,
                        messages,
                    });
                }
                Err(err) => warn!(thread_id = %thread_id, error = %err, "session: refresh failed"),
            }
        }
    }

    async fn transmit(&self, entry: OutboundQueueEntry) -> FlushStep {
        let payload = match serde_json::to_value(&entry.request) {
            Ok(payload) => payload,
            Err(err) => {
                self.fail_send(&entry, format!("failed to encode message: {err}"));
                return FlushStep::Rejected;
            }
        };

        let sent = tokio::time::timeout(
            self.config.ack_timeout,
            self.connection
                .transport()
                .send(events::SEND_MESSAGE, payload.clone()),
        )
        .await;

        match sent {
            Ok(Ok(ack)) => {
                self.confirm_send(&entry, payload, ack).await;
                FlushStep::Delivered
            }
            Ok(Err(err)) if err.is_connection_level() => {
                warn!(local_id = %entry.local_id(), error = %err, "session: send interrupted");
                FlushStep::Interrupted
            }
            Ok(Err(err)) => {
                self.fail_send(&entry, err.to_string());
                FlushStep::Rejected
            }
            Err(_) => {
                self.fail_send(
                    &entry,
                    format!(
                        "no acknowledgment within {}ms",
                        self.config.ack_timeout.as_millis()
                    ),
                );
                FlushStep::Rejected
            }
        }
    }

    async fn confirm_send(&self, entry: &OutboundQueueEntry, request: Value, ack: Value) {
        // The ack may carry only the server id; fill the rest from the request.
        let server_id = acknowledged_id(&ack);
        let mut confirmed = request;
        if let Value::Object(fields) = &mut confirmed {
            fields.insert("senderId".into(), Value::String(self.user_id.to_string()));
            fields.insert(
                "createdAt".into(),
                Value::String(entry.enqueued_at.to_rfc3339()),
            );
            match ack {
                Value::Object(ack_fields) => fields.extend(ack_fields),
                Value::String(id) => {
                    fields.insert("id".into(), Value::String(id));
                }
                _ => {}
            }
        }

        // The peer accepted the send even when its ack is unusable, so the
        // placeholder is settled from the request rather than left pending.
        let message = match normalize(&confirmed, Utc::now()) {
            Ok(message) => message,
            Err(err) => {
                warn!(local_id = %entry.local_id(), error = %err, "session: unusable acknowledgment, confirming from request");
                Message {
                    id: server_id,
                    ..Message::from_request(&entry.request, self.user_id.clone(), entry.enqueued_at)
                }
            }
        };
        let outcome =
            lock(&self.store).reconcile(&entry.thread_id, entry.local_id(), Ok(message));
        match outcome {
            ReconcileOutcome::Confirmed(message) => {
                debug!(local_id = %entry.local_id(), id = ?message.id, "session: send confirmed");
                self.notify_thread(&entry.thread_id, ThreadEvent::MessageConfirmed(message));
                self.persist_thread(&entry.thread_id).await;
            }
            ReconcileOutcome::Failed(_) | ReconcileOutcome::Unknown => {
                debug!(local_id = %entry.local_id(), "session: ack for unknown message");
            }
        }
    }

    fn fail_send(&self, entry: &OutboundQueueEntry, reason: String) {
        error!(
            thread_id = %entry.thread_id,
            local_id = %entry.local_id(),
            %reason,
            "session: send failed"
        );
        let outcome =
            lock(&self.store).reconcile(&entry.thread_id, entry.local_id(), Err(reason.clone()));
        if let ReconcileOutcome::Failed(message) = outcome {
            self.notify_thread(
                &entry.thread_id,
                ThreadEvent::MessageFailed {
                    message,
                    reason: reason.clone(),
                },
            );
        }
        let _ = self.events.send(SyncEvent::SendFailed(SendError {
            local_id: entry.local_id().clone(),
            thread_id: entry.thread_id.clone(),
            reason,
        }));
    }

    async fn send_membership(&self, event: &str, thread_id: &ThreadId) -> bool {
        let payload = match serde_json::to_value(ThreadMembershipRequest {
            thread_id: thread_id.clone(),
        }) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "session: failed to encode membership request");
                return false;
            }
        };
        match tokio::time::timeout(
            self.config.ack_timeout,
            self.connection.transport().send(event, payload),
        )
        .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                warn!(%event, thread_id = %thread_id, error = %err, "session: membership request failed");
                false
            }
            Err(_) => {
                warn!(%event, thread_id = %thread_id, "session: membership request timed out");
                false
            }
        }
    }
}

fn payload_text(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// Server id carried by a `send-message` ack, either bare or as a field.
fn acknowledged_id(ack: &Value) -> Option<MessageId> {
    match ack {
        Value::String(id) => MessageId::non_empty(id.as_str()),
        Value::Object(_) => {
            payload_text(ack, &["id", "_id", "messageId"]).and_then(MessageId::non_empty)
        }
        _ => None,
    }
}

fn payload_thread_id(payload: &Value) -> Option<ThreadId> {
    payload_text(payload, &["threadId", "thread_id", "conversationId"])
        .and_then(ThreadId::non_empty)
}

struct Driver {
    shared: Arc<SessionShared>,
    queue: OutboundQueue,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_handle: mpsc::WeakUnboundedSender<Command>,
    refresh: Option<ScheduledTask>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(event) = self.connection_events.recv() => {
                    self.on_connection_event(event).await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.refresh = None;
                        if let Err(err) = self.queue.clear().await {
                            warn!(error = %err, "session: failed to clear outbound queue");
                        }
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.on_command(command).await,
                    None => return,
                },
            }
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(snapshot) => {
                if snapshot.state != ConnectionState::Connected {
                    self.shared.registry.clear_joined();
                }
                self.shared.publish_status();
            }
            ConnectionEvent::Connected => {
                self.rejoin_all().await;
                self.flush().await;
                self.schedule_refresh();
            }
            ConnectionEvent::Inbound { event, payload } => self.on_inbound(&event, payload).await,
        }
    }

    async fn rejoin_all(&mut self) {
        let threads = self.shared.registry.begin_rejoin();
        for thread_id in &threads {
            if self
                .shared
                .send_membership(events::JOIN_THREAD, thread_id)
                .await
            {
                self.shared.registry.mark_joined(thread_id);
            }
        }
        if !threads.is_empty() {
            info!(threads = threads.len(), "session: rejoined tracked threads");
        }
    }

    async fn flush(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.queue
            .flush(|entry| {
                let shared = Arc::clone(&shared);
                async move { shared.transmit(entry).await }
            })
            .await;
        self.shared.publish_status();
    }

    fn schedule_refresh(&mut self) {
        if !self.shared.bulk_fetch_enabled || self.shared.registry.tracked_threads().is_empty() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let command_handle = self.command_handle.clone();
        self.refresh = Some(ScheduledTask::spawn(async move {
            shared.refresh_tracked(&command_handle).await;
        }));
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Transmit(entry) => {
                let sent_now = self.shared.connection.is_connected()
                    && self.queue.is_empty()
                    && self.shared.transmit(entry.clone()).await != FlushStep::Interrupted;
                if sent_now {
                    return;
                }
                if let Err(err) = self.queue.enqueue(entry).await {
                    warn!(error = %err, "session: failed to persist outbound queue");
                }
                self.shared.publish_status();
            }
            Command::Join(thread_id) => {
                if self.shared.connection.is_connected()
                    && self
                        .shared
                        .send_membership(events::JOIN_THREAD, &thread_id)
                        .await
                {
                    self.shared.registry.mark_joined(&thread_id);
                }
            }
            Command::Leave(thread_id) => {
                if self.shared.connection.is_connected() {
                    self.shared
                        .send_membership(events::LEAVE_THREAD, &thread_id)
                        .await;
                }
            }
            Command::Merge {
                thread_id,
                messages,
            } => {
                let accepted = lock(&self.shared.store).merge_batch(&thread_id, messages);
                if accepted.is_empty() {
                    return;
                }
                debug!(thread_id = %thread_id, accepted = accepted.len(), "session: merged fetched messages");
                for message in accepted {
                    self.deliver(message, false);
                }
                self.shared.persist_thread(&thread_id).await;
            }
            Command::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    /// Sends an accepted message to its thread handler and the persistent
    /// new-message handlers.
    fn deliver(&self, message: Message, confirmed: bool) {
        let thread_event = if confirmed {
            ThreadEvent::MessageConfirmed(message.clone())
        } else {
            ThreadEvent::MessageAdded(message.clone())
        };
        self.shared.registry.dispatch(
            &Incoming {
                thread_id: message.thread_id.clone(),
                thread_event: Some(thread_event),
                persistent: Some(PersistentEvent::NewMessage(message)),
            },
            &self.shared.router,
        );
    }

    async fn on_inbound(&mut self, event: &str, payload: Value) {
        let Some(kind) = DomainEventKind::from_name(event) else {
            debug!(%event, "session: ignoring unknown event");
            return;
        };

        match kind {
            DomainEventKind::NewMessage => {
                let outcome = lock(&self.shared.store).ingest(&payload, Utc::now());
                match outcome {
                    Ok(InsertOutcome::Inserted(message)) => {
                        let thread_id = message.thread_id.clone();
                        self.deliver(message, false);
                        self.shared.persist_thread(&thread_id).await;
                    }
                    Ok(InsertOutcome::Confirmed(message)) => {
                        let thread_id = message.thread_id.clone();
                        self.deliver(message, true);
                        self.shared.persist_thread(&thread_id).await;
                    }
                    Ok(InsertOutcome::Duplicate(reason)) => {
                        debug!(?reason, "session: duplicate message dropped");
                    }
                    Err(err) => {
                        warn!(error = %err, "session: dropping malformed message payload");
                    }
                }
            }
            DomainEventKind::MessageNotification | DomainEventKind::Invitation => {
                let notification = classify_notification(event, &payload);
                let delivered = self.shared.router.deliver(&notification);
                debug!(%event, delivered, "session: notification delivered");
            }
            DomainEventKind::ThreadJoined => {
                let Some(thread_id) = payload_thread_id(&payload) else {
                    warn!("session: thread-joined without thread id");
                    return;
                };
                self.shared.registry.mark_joined(&thread_id);
                self.shared.notify_thread(&thread_id, ThreadEvent::Joined);
            }
            DomainEventKind::Typing | DomainEventKind::TypingStopped => {
                let thread_id = payload_thread_id(&payload);
                let user_id = payload_text(&payload, &["userId", "user_id", "senderId"])
                    .and_then(UserId::non_empty);
                let (Some(thread_id), Some(user_id)) = (thread_id, user_id) else {
                    debug!(%event, "session: typing event without thread or user");
                    return;
                };
                let thread_event = if kind == DomainEventKind::Typing {
                    ThreadEvent::Typing { user_id }
                } else {
                    ThreadEvent::TypingStopped { user_id }
                };
                self.shared.notify_thread(&thread_id, thread_event);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
