use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde_json::Value;
use shared::{domain::ThreadId, protocol::events};
use tracing::debug;

use crate::{
    lock,
    types::{EventCategory, Notification, PersistentEvent},
};

pub type PersistentHandler = Arc<dyn Fn(&PersistentEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

#[derive(Default)]
struct RouterState {
    next_id: u64,
    handlers: HashMap<EventCategory, Vec<(HandlerId, PersistentHandler)>>,
}

/// Session-long handlers for app-wide concerns such as unread badges and
/// toasts. Handlers stay registered until explicitly removed, regardless of
/// which thread views come and go.
#[derive(Default)]
pub struct NotificationRouter {
    state: Mutex<RouterState>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, category: EventCategory, handler: PersistentHandler) -> HandlerId {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = HandlerId(state.next_id);
        state
            .handlers
            .entry(category)
            .or_default()
            .push((id, handler));
        debug!(?category, handler_id = id.0, "notifications: handler registered");
        id
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut state = lock(&self.state);
        let mut removed = false;
        for handlers in state.handlers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            removed |= handlers.len() != before;
        }
        removed
    }

    pub fn handler_count(&self, category: EventCategory) -> usize {
        lock(&self.state)
            .handlers
            .get(&category)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Calls every handler registered for the event's category and returns
    /// how many were invoked.
    pub fn deliver(&self, event: &PersistentEvent) -> usize {
        // Snapshot first so handlers may register or unregister re-entrantly.
        let handlers: Vec<PersistentHandler> = lock(&self.state)
            .handlers
            .get(&event.category())
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn clear(&self) {
        lock(&self.state).handlers.clear();
    }
}

/// Turns a `message-notification` or `invitation` payload into the matching
/// persistent event.
pub fn classify_notification(event: &str, payload: &Value) -> PersistentEvent {
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| payload.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    };
    let kind = text(&["type", "kind"]).unwrap_or_else(|| event.to_string());
    let thread_id = text(&["threadId", "thread_id", "conversationId"]).and_then(ThreadId::non_empty);
    let notification = Notification {
        kind: kind.clone(),
        thread_id,
        title: text(&["title", "subject"]),
        body: text(&["body", "message", "preview", "content"]),
        payload: payload.clone(),
    };

    if event == events::INVITATION || kind.eq_ignore_ascii_case("invitation") {
        PersistentEvent::Invitation(notification)
    } else {
        PersistentEvent::Notification(notification)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn counting_handler(counter: &Arc<AtomicUsize>) -> PersistentHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_event: &PersistentEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn delivers_only_to_matching_category() {
        let router = NotificationRouter::new();
        let invites = Arc::new(AtomicUsize::new(0));
        let generic = Arc::new(AtomicUsize::new(0));
        router.register(EventCategory::Invitation, counting_handler(&invites));
        router.register(EventCategory::Notification, counting_handler(&generic));

        let event = classify_notification(
            events::MESSAGE_NOTIFICATION,
            &json!({ "type": "invitation", "title": "Join mentoring circle" }),
        );
        assert_eq!(router.deliver(&event), 1);
        assert_eq!(invites.load(Ordering::SeqCst), 1);
        assert_eq!(generic.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregister_removes_only_that_handler() {
        let router = NotificationRouter::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let first_id = router.register(EventCategory::Notification, counting_handler(&first));
        router.register(EventCategory::Notification, counting_handler(&second));

        assert!(router.unregister(first_id));
        assert!(!router.unregister(first_id));

        let event = classify_notification(events::MESSAGE_NOTIFICATION, &json!({ "body": "hi" }));
        router.deliver(&event);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(router.handler_count(EventCategory::Notification), 1);
    }

    #[test]
    fn handlers_may_unregister_themselves_while_delivering() {
        let router = Arc::new(NotificationRouter::new());
        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let router_ref = Arc::clone(&router);
        let slot_ref = Arc::clone(&slot);
        let id = router.register(
            EventCategory::Notification,
            Arc::new(move |_event: &PersistentEvent| {
                if let Some(id) = lock(&slot_ref).take() {
                    router_ref.unregister(id);
                }
            }),
        );
        *lock(&slot) = Some(id);

        let event = classify_notification(events::MESSAGE_NOTIFICATION, &json!({}));
        assert_eq!(router.deliver(&event), 1);
        assert_eq!(router.deliver(&event), 0);
    }

    #[test]
    fn classifies_generic_notifications_with_thread() {
        let event = classify_notification(
            events::MESSAGE_NOTIFICATION,
            &json!({ "threadId": "T9", "preview": "see you at 3" }),
        );
        match event {
            PersistentEvent::Notification(notification) => {
                assert_eq!(notification.thread_id, Some(ThreadId::from("T9")));
                assert_eq!(notification.body.as_deref(), Some("see you at 3"));
                assert_eq!(notification.kind, events::MESSAGE_NOTIFICATION);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
