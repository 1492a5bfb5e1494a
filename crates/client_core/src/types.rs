use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::{Attachment, LocalId, MessageId, MessageStatus, ThreadId, UserId},
    protocol::SendMessageRequest,
};

use crate::error::SendError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
}

impl Message {
    /// Builds the optimistic local echo of an outgoing send.
    pub fn from_request(
        request: &SendMessageRequest,
        sender_id: UserId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            local_id: Some(request.local_id.clone()),
            thread_id: request.thread_id.clone(),
            sender_id,
            content: request.content.clone(),
            attachments: request.attachments.clone(),
            created_at,
            status: MessageStatus::Pending,
            reply_to_id: request.reply_to_id.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub id: ThreadId,
    pub participants: BTreeSet<UserId>,
    pub messages: Vec<Message>,
    pub last_message: Option<Message>,
    pub unread_counts: HashMap<UserId, u32>,
}

impl Thread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            participants: BTreeSet::new(),
            messages: Vec::new(),
            last_message: None,
            unread_counts: HashMap::new(),
        }
    }

    pub fn unread_for(&self, user_id: &UserId) -> u32 {
        self.unread_counts.get(user_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Connection-level view owned by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

/// Status exposed to consumers, polled or pushed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub is_connected: bool,
    pub is_reconnecting: bool,
    pub attempt_count: u32,
    pub queued_count: usize,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn from_snapshot(snapshot: &ConnectionSnapshot, queued_count: usize) -> Self {
        Self {
            state: snapshot.state,
            is_connected: snapshot.state == ConnectionState::Connected,
            is_reconnecting: snapshot.state == ConnectionState::Reconnecting,
            attempt_count: snapshot.attempt_count,
            queued_count,
            last_error: snapshot.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundQueueEntry {
    pub thread_id: ThreadId,
    pub request: SendMessageRequest,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboundQueueEntry {
    pub fn new(request: SendMessageRequest) -> Self {
        Self {
            thread_id: request.thread_id.clone(),
            request,
            enqueued_at: Utc::now(),
        }
    }

    pub fn local_id(&self) -> &LocalId {
        &self.request.local_id
    }
}

/// Events delivered to the handler of the thread they belong to.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadEvent {
    MessageAdded(Message),
    MessageConfirmed(Message),
    MessageFailed { message: Message, reason: String },
    Typing { user_id: UserId },
    TypingStopped { user_id: UserId },
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    NewMessage,
    Notification,
    Invitation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: String,
    pub thread_id: Option<ThreadId>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub payload: Value,
}

/// Events delivered to session-long handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistentEvent {
    NewMessage(Message),
    Notification(Notification),
    Invitation(Notification),
}

impl PersistentEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::NewMessage(_) => EventCategory::NewMessage,
            Self::Notification(_) => EventCategory::Notification,
            Self::Invitation(_) => EventCategory::Invitation,
        }
    }

    pub fn thread_id(&self) -> Option<&ThreadId> {
        match self {
            Self::NewMessage(message) => Some(&message.thread_id),
            Self::Notification(notification) | Self::Invitation(notification) => {
                notification.thread_id.as_ref()
            }
        }
    }
}

/// Session-level broadcast, mirroring what a status bar or toast layer needs.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StatusChanged(ConnectionStatus),
    SendFailed(SendError),
    ThreadsLoaded(Vec<ThreadId>),
}
