//! Sync milestone events.

use crate::error::FailureCause;
use crate::job::{Direction, JobId, TransferSummary};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Totals of a completed pull-then-push cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    /// The pull leg.
    pub pulled: TransferSummary,
    /// The push leg.
    pub pushed: TransferSummary,
}

/// A milestone observable by any number of subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A pull finished and its documents are visible locally.
    PullCompleted {
        /// The finished job.
        job: JobId,
        /// What was transferred.
        summary: TransferSummary,
    },
    /// A push finished.
    PushCompleted {
        /// The finished job.
        job: JobId,
        /// What was transferred.
        summary: TransferSummary,
    },
    /// A full pull-then-push cycle finished.
    SyncCompleted(SyncSummary),
    /// A replication failed. Emitted once per failure.
    ReplicationFailed {
        /// The leg that failed.
        direction: Direction,
        /// True if the leg was part of a composite sync.
        composite: bool,
        /// Failure classification.
        cause: FailureCause,
        /// Error text.
        message: String,
    },
}

/// Receives events on the delivery context.
pub trait SyncObserver: Send + Sync {
    /// Called once per event, in emission order.
    fn on_event(&self, event: &SyncEvent);
}

/// Fan-out of sync events to channel subscribers and registered observers.
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
    observers: RwLock<Vec<Arc<dyn SyncObserver>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Sends `event` to every subscriber and observer.
    pub fn emit(&self, event: SyncEvent) {
        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.on_event(&event);
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    /// Returns a receiver for events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Registers an observer for events emitted from now on.
    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.observers.write().push(observer);
    }
}
