use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use shared::domain::ThreadId;
use tracing::debug;

use crate::{
    lock,
    notifications::NotificationRouter,
    types::{PersistentEvent, ThreadEvent},
};

pub type ThreadHandler = Arc<dyn Fn(&ThreadEvent) + Send + Sync>;

/// An accepted inbound event, split into what the thread view sees and what
/// the session-long handlers see.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub thread_id: ThreadId,
    pub thread_event: Option<ThreadEvent>,
    pub persistent: Option<PersistentEvent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub thread_handler_called: bool,
    pub persistent_handlers_called: usize,
}

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<ThreadId, ThreadHandler>,
    joined: HashSet<ThreadId>,
}

/// Per-thread interest. The tracked set is the key set of `handlers`; the
/// joined set is rebuilt from scratch on every (re)connect.
#[derive(Default)]
pub struct ThreadSubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl ThreadSubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `thread_id`, replacing any previous one.
    /// Returns true when the thread was not tracked before.
    pub fn subscribe(&self, thread_id: ThreadId, handler: ThreadHandler) -> bool {
        let replaced = lock(&self.state)
            .handlers
            .insert(thread_id.clone(), handler)
            .is_some();
        debug!(thread_id = %thread_id, replaced, "registry: subscribed");
        !replaced
    }

    /// Returns true when a handler was removed.
    pub fn unsubscribe(&self, thread_id: &ThreadId) -> bool {
        let mut state = lock(&self.state);
        state.joined.remove(thread_id);
        state.handlers.remove(thread_id).is_some()
    }

    pub fn is_subscribed(&self, thread_id: &ThreadId) -> bool {
        lock(&self.state).handlers.contains_key(thread_id)
    }

    pub fn tracked_threads(&self) -> BTreeSet<ThreadId> {
        lock(&self.state).handlers.keys().cloned().collect()
    }

    /// Forgets every confirmed membership and returns the threads to rejoin.
    pub fn begin_rejoin(&self) -> BTreeSet<ThreadId> {
        let mut state = lock(&self.state);
        state.joined.clear();
        state.handlers.keys().cloned().collect()
    }

    /// Records a confirmed join; ignored for threads no longer tracked.
    pub fn mark_joined(&self, thread_id: &ThreadId) -> bool {
        let mut state = lock(&self.state);
        if !state.handlers.contains_key(thread_id) {
            return false;
        }
        state.joined.insert(thread_id.clone())
    }

    pub fn is_joined(&self, thread_id: &ThreadId) -> bool {
        lock(&self.state).joined.contains(thread_id)
    }

    pub fn clear_joined(&self) {
        lock(&self.state).joined.clear();
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.handlers.clear();
        state.joined.clear();
    }

    pub fn dispatch(&self, incoming: &Incoming, router: &NotificationRouter) -> DispatchReport {
        let handler = lock(&self.state).handlers.get(&incoming.thread_id).cloned();

        let mut report = DispatchReport::default();
        if let (Some(handler), Some(event)) = (handler, incoming.thread_event.as_ref()) {
            handler(event);
            report.thread_handler_called = true;
        }
        if let Some(persistent) = incoming.persistent.as_ref() {
            report.persistent_handlers_called = router.deliver(persistent);
        }
        report
    }
}
