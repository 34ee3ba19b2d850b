//! Publish/subscribe surface for engine state changes.
//!
//! Subscribers register callbacks and receive an immutable snapshot with
//! every notification. A `watch` channel carries the latest snapshot for
//! consumers that only care about current state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::models::snapshot::{ChangeKind, EngineSnapshot, Notification};

/// Callback invoked for every published notification.
pub type Subscriber = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Identifier returned by [`Notifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of change notifications.
pub struct Notifier {
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber>>,
    latest: watch::Sender<Arc<EngineSnapshot>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    /// Notifier with no subscribers and an empty initial snapshot.
    #[must_use]
    pub fn new() -> Self {
        let (latest, _) = watch::channel(Arc::new(EngineSnapshot::default()));
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(BTreeMap::new()),
            latest,
        }
    }

    /// Register a callback.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Receiver tracking the latest published snapshot.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<EngineSnapshot>> {
        self.latest.subscribe()
    }

    /// Deliver a notification to every subscriber.
    ///
    /// Callbacks run on the publishing task, outside the registry lock, so
    /// a callback may itself subscribe or unsubscribe.
    pub fn publish(&self, kind: ChangeKind, snapshot: Arc<EngineSnapshot>) {
        self.latest.send_replace(Arc::clone(&snapshot));
        let callbacks: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        debug!(?kind, subscribers = callbacks.len(), "publishing notification");
        let notification = Notification { kind, snapshot };
        for callback in callbacks {
            callback(&notification);
        }
    }
}
