use std::sync::Arc;

use anyhow::Result;
use shared::domain::ThreadId;
use storage::{load_json, save_json, KeyValueStore};

use crate::types::Message;

const KEY_PREFIX: &str = "messages:";
/// Newest messages kept per thread.
pub const CACHED_MESSAGES_PER_THREAD: usize = 200;

/// Last-known message lists per thread, used to paint a thread before the
/// bulk fetch returns. Only server-confirmed messages are cached.
#[derive(Clone)]
pub struct MessageCache {
    store: Arc<dyn KeyValueStore>,
}

impl MessageCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(thread_id: &ThreadId) -> String {
        format!("{KEY_PREFIX}{thread_id}")
    }

    pub async fn load(&self, thread_id: &ThreadId) -> Result<Vec<Message>> {
        Ok(load_json(self.store.as_ref(), &Self::key(thread_id))
            .await?
            .unwrap_or_default())
    }

    pub async fn save(&self, thread_id: &ThreadId, messages: &[Message]) -> Result<()> {
        let confirmed: Vec<&Message> = messages
            .iter()
            .filter(|message| message.id.is_some() && !message.is_pending())
            .collect();
        let start = confirmed.len().saturating_sub(CACHED_MESSAGES_PER_THREAD);
        save_json(self.store.as_ref(), &Self::key(thread_id), &confirmed[start..]).await
    }
}
