use shared::domain::{LocalId, ThreadId};
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Network or protocol failure; transient and drives the backoff loop.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Credentials were refused; terminal until new credentials are supplied.
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
    #[error("bulk fetch failed: {0:#}")]
    Fetch(anyhow::Error),
    #[error("message has neither content nor attachments")]
    EmptyMessage,
    #[error("sync session has been shut down")]
    SessionClosed,
}

impl From<TransportError> for SyncError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Rejected(message) => Self::Auth(message),
            other => Self::Connection(other.to_string()),
        }
    }
}

/// Per-message failure. The message is marked failed and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to send message {local_id} to thread {thread_id}: {reason}")]
pub struct SendError {
    pub local_id: LocalId,
    pub thread_id: ThreadId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPayloadError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no resolvable thread id")]
    MissingThread,
    #[error("payload has no resolvable sender")]
    MissingSender,
    #[error("unrecognized sender shape: {0}")]
    UnrecognizedSender(String),
}
