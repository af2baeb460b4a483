//! Event subscription registry.
//!
//! Tracks active subscribers and fans every published event out to them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::SyncEvent;

/// Sender half held by the bus for each subscriber.
pub type EventSender = mpsc::UnboundedSender<SyncEvent>;

/// A live subscription.
///
/// Dropping it (or its receiver) is enough to stop receiving; the bus prunes
/// closed channels on the next publish.
#[derive(Debug)]
pub struct Subscription {
    /// Identifier to pass to [`EventBus::unsubscribe`]
    pub id: String,
    /// Incoming events
    pub receiver: mpsc::UnboundedReceiver<SyncEvent>,
}

impl Subscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }

    /// Take an event if one is queued.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Fans events out to subscribers.
///
/// Thread-safe and can be shared via `Arc`.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: DashMap<String, EventSender>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Create a new bus wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();

        self.subscribers.insert(id.clone(), sender);
        tracing::debug!(subscriber = %id, "Event subscriber registered");

        Subscription { id, receiver }
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            tracing::debug!(subscriber = %id, "Event subscriber unregistered");
        }
        removed
    }

    /// Send an event to every subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: SyncEvent) -> usize {
        let mut sent_count = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            if entry.value().send(event.clone()).is_ok() {
                sent_count += 1;
            } else {
                closed.push(entry.key().clone());
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
        }

        sent_count
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
