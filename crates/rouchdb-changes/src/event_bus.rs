//! Store-wide notification bus.
//!
//! Distinct from [`crate::ChangeSender`] (which only carries per-adapter
//! `_changes`-feed sequence notifications): the event bus carries the
//! closed set of lifecycle events a store can emit — document writes and
//! store open/create/delete/close — for callers that want to react to
//! activity without polling the changes feed. Built on the same
//! `tokio::sync::broadcast` pattern `ChangeSender`/`ChangeReceiver` already
//! use.

use tokio::sync::broadcast;

/// A document-level event, keyed by the revision that caused it.
#[derive(Debug, Clone)]
pub enum DocumentEvent {
    Created { doc_id: String, rev: String },
    Updated { doc_id: String, rev: String },
    Deleted { doc_id: String, rev: String },
}

/// A store lifecycle event.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Opened { name: String },
    Created { name: String },
    Deleted { name: String },
    Closed { name: String },
}

/// A replication lifecycle event, published by `rouchdb-replication`.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    /// Replication was cancelled or otherwise stopped before completion.
    /// Counters are reported as of the moment of termination.
    Terminated {
        docs_read: u64,
        docs_written: u64,
        batches: u64,
    },
}

/// The closed set of events a store (or a replication running against it)
/// can publish.
#[derive(Debug, Clone)]
pub enum Event {
    Document(DocumentEvent),
    Store(StoreEvent),
    Replication(ReplicationEvent),
}

/// A cloneable publish/subscribe handle. Cloning shares the same underlying
/// channel (like `ChangeSender`), so every adapter instance can hand out its
/// bus to callers without an `Arc` wrapper.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Publish an event. Ignored if nobody is subscribed.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
