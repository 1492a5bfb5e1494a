use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::Result;
use shared::domain::UserId;
use storage::{load_json, save_json, KeyValueStore};
use tracing::{info, warn};

use crate::types::OutboundQueueEntry;

/// Result of handing one queued entry to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStep {
    Delivered,
    /// The peer refused this message; it is dropped from the queue.
    Rejected,
    /// The link failed; this entry and everything behind it stay queued.
    Interrupted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub rejected: usize,
    pub remaining: usize,
}

/// FIFO of sends made while offline, mirrored to the key-value store so a
/// dropped connection inside one session loses nothing.
pub struct OutboundQueue {
    key: String,
    store: Arc<dyn KeyValueStore>,
    entries: VecDeque<OutboundQueueEntry>,
    depth: Arc<AtomicUsize>,
}

impl OutboundQueue {
    pub fn storage_key(user_id: &UserId) -> String {
        format!("outbound:{user_id}")
    }

    /// Opens the queue for `user_id`, picking up whatever a previous
    /// connection of this session left behind.
    pub async fn load(user_id: &UserId, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let key = Self::storage_key(user_id);
        let entries: VecDeque<OutboundQueueEntry> = load_json(store.as_ref(), &key)
            .await?
            .unwrap_or_default();
        if !entries.is_empty() {
            info!(queued = entries.len(), "queue: restored pending sends");
        }
        let depth = Arc::new(AtomicUsize::new(entries.len()));
        Ok(Self {
            key,
            store,
            entries,
            depth,
        })
    }

    /// Shared gauge of the queue length, readable without owning the queue.
    pub fn depth(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.depth)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<OutboundQueueEntry> {
        self.entries.iter().cloned().collect()
    }

    pub async fn enqueue(&mut self, entry: OutboundQueueEntry) -> Result<()> {
        info!(
            thread_id = %entry.thread_id,
            local_id = %entry.local_id(),
            "queue: message queued while offline"
        );
        self.entries.push_back(entry);
        self.sync_depth();
        self.persist().await
    }

    /// Sends entries front to back, waiting for each step before the next.
    pub async fn flush<F, Fut>(&mut self, mut transmit: F) -> FlushReport
    where
        F: FnMut(OutboundQueueEntry) -> Fut,
        Fut: Future<Output = FlushStep>,
    {
        let mut report = FlushReport::default();
        while let Some(entry) = self.entries.front().cloned() {
            match transmit(entry).await {
                FlushStep::Delivered => report.delivered += 1,
                FlushStep::Rejected => report.rejected += 1,
                FlushStep::Interrupted => break,
            }
            self.entries.pop_front();
            self.sync_depth();
            if let Err(err) = self.persist().await {
                warn!(error = %err, "queue: failed to persist after flush step");
            }
        }
        report.remaining = self.entries.len();
        if report.delivered + report.rejected > 0 || report.remaining > 0 {
            info!(
                delivered = report.delivered,
                rejected = report.rejected,
                remaining = report.remaining,
                "queue: flush finished"
            );
        }
        report
    }

    /// Drops every entry and the persisted copy.
    pub async fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.sync_depth();
        self.store.remove(&self.key).await
    }

    fn sync_depth(&self) {
        self.depth.store(self.entries.len(), Ordering::SeqCst);
    }

    async fn persist(&self) -> Result<()> {
        if self.entries.is_empty() {
            self.store.remove(&self.key).await
        } else {
            save_json(self.store.as_ref(), &self.key, &self.entries).await
        }
    }
}
