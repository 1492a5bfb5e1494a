use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::domain::{LocalId, MessageStatus, ThreadId, UserId};
use tracing::debug;

use crate::{
    error::MalformedPayloadError,
    normalize::{normalize, ThreadSummary},
    types::{Message, OutboundQueueEntry, Thread},
};

/// Where an insert attempt came from. Only live events bump unread counters,
/// and locally created messages skip the content-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertSource {
    Live,
    Optimistic,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    SameId,
    SameLocalId,
    ContentWindow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Message),
    /// An optimistic placeholder was replaced in place by its confirmation.
    Confirmed(Message),
    Duplicate(DuplicateReason),
}

impl InsertOutcome {
    pub fn accepted(&self) -> Option<&Message> {
        match self {
            Self::Inserted(message) | Self::Confirmed(message) => Some(message),
            Self::Duplicate(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Confirmed(Message),
    Failed(Message),
    /// No pending entry carries the local id any more.
    Unknown,
}

/// Canonical per-thread message lists.
///
/// Invariants held after every call: each list is sorted by `created_at`
/// (stable, so ties keep arrival order) and no two entries share a non-empty
/// `id` or `local_id`.
pub struct MessageStore {
    local_user: UserId,
    dedup_window: chrono::Duration,
    threads: HashMap<ThreadId, Thread>,
}

impl MessageStore {
    pub fn new(local_user: UserId, dedup_window: Duration) -> Self {
        Self {
            local_user,
            dedup_window: chrono::Duration::from_std(dedup_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(8)),
            threads: HashMap::new(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    fn thread_mut(&mut self, thread_id: &ThreadId) -> &mut Thread {
        let local_user = self.local_user.clone();
        self.threads.entry(thread_id.clone()).or_insert_with(|| {
            let mut thread = Thread::new(thread_id.clone());
            thread.participants.insert(local_user);
            thread
        })
    }

    /// Runs the dedup rules against the thread and stores `message` unless
    /// it is a duplicate.
    ///
    /// Rules, in order: same `id`; same `local_id` (a server copy of a pending
    /// entry confirms it instead); `id`/`local_id` cross match confirms; same
    /// sender, content and attachments within the dedup window. The window
    /// rule never applies to [`InsertSource::Optimistic`] inserts, so a user
    /// can repeat themselves, nor between two entries that both carry server
    /// ids, which the server has already told apart.
    pub fn insert(&mut self, message: Message, source: InsertSource) -> InsertOutcome {
        let window = self.dedup_window;
        let local_user = self.local_user.clone();
        let thread = self.thread_mut(&message.thread_id);

        if let Some(id) = &message.id {
            if thread.messages.iter().any(|m| m.id.as_ref() == Some(id)) {
                return InsertOutcome::Duplicate(DuplicateReason::SameId);
            }
        }

        if let Some(local_id) = &message.local_id {
            if let Some(index) = thread
                .messages
                .iter()
                .position(|m| m.local_id.as_ref() == Some(local_id))
            {
                // A server copy of our own pending message is its confirmation.
                if thread.messages[index].is_pending() && message.id.is_some() {
                    return InsertOutcome::Confirmed(confirm_at(thread, index, message));
                }
                return InsertOutcome::Duplicate(DuplicateReason::SameLocalId);
            }
        }

        let cross_match = thread.messages.iter().position(|m| {
            matches!((&m.id, &message.local_id), (Some(id), Some(local)) if id.as_str() == local.as_str())
                || matches!((&m.local_id, &message.id), (Some(local), Some(id)) if id.as_str() == local.as_str())
        });
        if let Some(index) = cross_match {
            return InsertOutcome::Confirmed(confirm_at(thread, index, message));
        }

        if source != InsertSource::Optimistic {
            let near_copy = thread.messages.iter().any(|m| {
                let both_confirmed = m.id.is_some() && message.id.is_some();
                !both_confirmed
                    && m.sender_id == message.sender_id
                    && m.content == message.content
                    && m.attachments == message.attachments
                    && (m.created_at - message.created_at).abs() < window
            });
            if near_copy {
                return InsertOutcome::Duplicate(DuplicateReason::ContentWindow);
            }
        }

        thread.participants.insert(message.sender_id.clone());
        if source == InsertSource::Live && message.sender_id != local_user {
            for participant in thread.participants.iter() {
                if *participant != message.sender_id {
                    *thread.unread_counts.entry(participant.clone()).or_insert(0) += 1;
                }
            }
        }
        thread.messages.push(message.clone());
        resort(thread);
        InsertOutcome::Inserted(message)
    }

    /// Normalizes a live payload and inserts it.
    pub fn ingest(
        &mut self,
        raw: &Value,
        arrived_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, MalformedPayloadError> {
        let message = normalize(raw, arrived_at)?;
        Ok(self.insert(message, InsertSource::Live))
    }

    /// Records `message` as the optimistic local echo of an outgoing send.
    pub fn create_optimistic(&mut self, message: Message) -> InsertOutcome {
        debug_assert!(message.local_id.is_some());
        self.insert(message, InsertSource::Optimistic)
    }

    /// Re-creates placeholders for sends still waiting in the outbound queue.
    pub fn restore_pending(&mut self, entries: &[OutboundQueueEntry]) -> usize {
        let mut restored = 0;
        for entry in entries {
            let message =
                Message::from_request(&entry.request, self.local_user.clone(), entry.enqueued_at);
            if let InsertOutcome::Inserted(_) = self.insert(message, InsertSource::Optimistic) {
                restored += 1;
            }
        }
        restored
    }

    /// Settles a pending send. Success replaces the placeholder with the
    /// server copy; failure removes it and hands it back marked failed.
    pub fn reconcile(
        &mut self,
        thread_id: &ThreadId,
        local_id: &LocalId,
        result: Result<Message, String>,
    ) -> ReconcileOutcome {
        let Some(thread) = self.threads.get_mut(thread_id) else {
            return ReconcileOutcome::Unknown;
        };
        let Some(index) = thread
            .messages
            .iter()
            .position(|m| m.local_id.as_ref() == Some(local_id))
        else {
            return ReconcileOutcome::Unknown;
        };

        match result {
            Ok(mut confirmed) => {
                confirmed.local_id = Some(local_id.clone());
                confirmed.status = MessageStatus::Sent;
                let existing = confirmed.id.as_ref().and_then(|id| {
                    thread
                        .messages
                        .iter()
                        .enumerate()
                        .find_map(|(i, m)| (i != index && m.id.as_ref() == Some(id)).then_some(i))
                });
                match existing {
                    // The push copy landed first under its own entry; keep that one.
                    Some(other) => {
                        thread.messages[other].local_id = Some(local_id.clone());
                        let kept = thread.messages[other].clone();
                        thread.messages.remove(index);
                        refresh_last(thread);
                        ReconcileOutcome::Confirmed(kept)
                    }
                    None => ReconcileOutcome::Confirmed(confirm_at(thread, index, confirmed)),
                }
            }
            // Already confirmed through another path; the message was delivered.
            Err(_) if !thread.messages[index].is_pending() => ReconcileOutcome::Unknown,
            Err(reason) => {
                let mut failed = thread.messages.remove(index);
                failed.status = MessageStatus::Failed;
                refresh_last(thread);
                debug!(thread_id = %thread_id, local_id = %local_id, %reason, "store: pending message dropped");
                ReconcileOutcome::Failed(failed)
            }
        }
    }

    /// Inserts bulk-fetched or cached messages. Returns those accepted.
    pub fn merge_batch(&mut self, thread_id: &ThreadId, batch: Vec<Message>) -> Vec<Message> {
        self.thread_mut(thread_id);
        batch
            .into_iter()
            .filter(|message| message.thread_id == *thread_id)
            .filter_map(|message| {
                self.insert(message, InsertSource::History)
                    .accepted()
                    .cloned()
            })
            .collect()
    }

    pub fn upsert_thread_summary(&mut self, summary: ThreadSummary) {
        let local_user = self.local_user.clone();
        let thread = self.thread_mut(&summary.id);
        thread.participants.extend(summary.participants);
        thread
            .unread_counts
            .insert(local_user, summary.unread_count);
        if let Some(last) = summary.last_message {
            self.insert(last, InsertSource::History);
        }
    }

    pub fn messages(&self, thread_id: &ThreadId) -> Vec<Message> {
        self.threads
            .get(thread_id)
            .map(|thread| thread.messages.clone())
            .unwrap_or_default()
    }

    pub fn thread(&self, thread_id: &ThreadId) -> Option<Thread> {
        self.threads.get(thread_id).cloned()
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        let mut ids: Vec<_> = self.threads.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn mark_read(&mut self, thread_id: &ThreadId, user_id: &UserId) {
        if let Some(thread) = self.threads.get_mut(thread_id) {
            thread.unread_counts.insert(user_id.clone(), 0);
        }
    }

    pub fn clear(&mut self) {
        self.threads.clear();
    }
}

/// Overwrites the entry at `index` with the confirmed copy, keeping whichever
/// ids only one side knows.
fn confirm_at(thread: &mut Thread, index: usize, incoming: Message) -> Message {
    let stored = &mut thread.messages[index];
    let id = incoming.id.or_else(|| stored.id.take());
    let local_id = incoming.local_id.or_else(|| stored.local_id.take());
    *stored = Message {
        id,
        local_id,
        status: MessageStatus::Sent,
        ..incoming
    };
    let confirmed = stored.clone();
    thread.participants.insert(confirmed.sender_id.clone());
    resort(thread);
    confirmed
}

fn resort(thread: &mut Thread) {
    thread.messages.sort_by_key(|message| message.created_at);
    refresh_last(thread);
}

fn refresh_last(thread: &mut Thread) {
    thread.last_message = thread.messages.last().cloned();
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
