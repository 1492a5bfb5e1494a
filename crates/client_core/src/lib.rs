use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod notifications;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use config::{load_config, SyncConfig};
pub use connection::{ConnectionManager, ConnectionSettings, Credentials};
pub use error::{MalformedPayloadError, SendError, SyncError};
pub use fetch::{BulkFetcher, HttpFetcher, MissingBulkFetcher};
pub use notifications::{HandlerId, NotificationRouter, PersistentHandler};
pub use registry::{ThreadHandler, ThreadSubscriptionRegistry};
pub use session::SyncSession;
pub use store::MessageStore;
pub use transport::{Transport, WebSocketTransport};
pub use types::{
    ConnectionState, ConnectionStatus, EventCategory, Message, Notification, PersistentEvent,
    SyncEvent, Thread, ThreadEvent,
};

/// Locks a std mutex, recovering the data if a handler panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
