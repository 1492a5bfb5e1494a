//! Wire format shared by the event-stream transport and its peers.
//!
//! Every frame is a JSON object `{ "event", "payload", "ackId"?, "error"? }`.
//! Requests that expect an acknowledgment carry an `ackId`; the peer answers
//! with an `ack` frame carrying the same id and either a payload or an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{Attachment, LocalId, MessageId, ThreadId},
    error::ApiError,
};

pub mod events {
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const CONNECT_ERROR: &str = "connect_error";
    pub const ACK: &str = "ack";

    pub const NEW_MESSAGE: &str = "new-message";
    pub const MESSAGE_NOTIFICATION: &str = "message-notification";
    pub const INVITATION: &str = "invitation";
    pub const THREAD_JOINED: &str = "thread-joined";
    pub const TYPING: &str = "typing";
    pub const TYPING_STOPPED: &str = "typing-stopped";

    pub const SEND_MESSAGE: &str = "send-message";
    pub const JOIN_THREAD: &str = "join-thread";
    pub const LEAVE_THREAD: &str = "leave-thread";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Frame {
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            ack_id: None,
            error: None,
        }
    }

    pub fn request(event: impl Into<String>, payload: Value, ack_id: u64) -> Self {
        Self {
            ack_id: Some(ack_id),
            ..Self::event(event, payload)
        }
    }

    pub fn ack(ack_id: u64, result: Result<Value, ApiError>) -> Self {
        match result {
            Ok(payload) => Self {
                event: events::ACK.to_string(),
                payload,
                ack_id: Some(ack_id),
                error: None,
            },
            Err(error) => Self {
                event: events::ACK.to_string(),
                payload: Value::Null,
                ack_id: Some(ack_id),
                error: Some(error),
            },
        }
    }
}

/// Domain events a peer pushes over the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainEventKind {
    NewMessage,
    MessageNotification,
    Invitation,
    ThreadJoined,
    Typing,
    TypingStopped,
}

impl DomainEventKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            events::NEW_MESSAGE => Some(Self::NewMessage),
            events::MESSAGE_NOTIFICATION => Some(Self::MessageNotification),
            events::INVITATION => Some(Self::Invitation),
            events::THREAD_JOINED => Some(Self::ThreadJoined),
            events::TYPING => Some(Self::Typing),
            events::TYPING_STOPPED => Some(Self::TypingStopped),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NewMessage => events::NEW_MESSAGE,
            Self::MessageNotification => events::MESSAGE_NOTIFICATION,
            Self::Invitation => events::INVITATION,
            Self::ThreadJoined => events::THREAD_JOINED,
            Self::Typing => events::TYPING,
            Self::TypingStopped => events::TYPING_STOPPED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub thread_id: ThreadId,
    pub local_id: LocalId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMembershipRequest {
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectErrorPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}
