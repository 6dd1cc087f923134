//! The completion delivery context.
//!
//! Replication runs on the blocking pool, but everything a consumer can
//! observe (completion callbacks, events, failure reports) runs on a
//! single serial context. Consumers therefore never see two notifications
//! at once.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::warn;

/// Work handed to a delivery context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A serial executor for consumer-visible work.
///
/// Implementations must run tasks one at a time, in the order they were
/// delivered.
pub trait Delivery: Send + Sync {
    /// Queues `task` to run on the delivery context.
    fn deliver(&self, task: Task);
}

/// Runs every task on one dedicated thread.
#[derive(Debug)]
pub struct ThreadDelivery {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadDelivery {
    /// Default name of the delivery thread.
    pub const THREAD_NAME: &'static str = "docsync-delivery";

    /// Spawns the delivery thread.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the thread cannot be spawned.
    pub fn new() -> SyncResult<Self> {
        Self::named(Self::THREAD_NAME)
    }

    /// Spawns the delivery thread under a custom name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the thread cannot be spawned.
    pub fn named(name: &str) -> SyncResult<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in receiver {
                    task();
                }
            })
            .map_err(|e| SyncError::configuration(format!("cannot start {name} thread: {e}")))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl ThreadDelivery {
    /// Blocks until every task delivered so far has run.
    ///
    /// Returns immediately when called from a delivered task.
    pub fn flush(&self) {
        let on_delivery_thread = self
            .handle
            .lock()
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id());
        if on_delivery_thread {
            return;
        }

        let (done_tx, done_rx) = mpsc::channel();
        self.deliver(Box::new(move || {
            let _ = done_tx.send(());
        }));
        // A closed channel means the thread is gone and nothing is pending.
        let _ = done_rx.recv();
    }
}

impl Delivery for ThreadDelivery {
    fn deliver(&self, task: Task) {
        let sender = self.sender.lock();
        let delivered = sender.as_ref().is_some_and(|s| s.send(task).is_ok());
        if !delivered {
            warn!("delivery context stopped, dropping notification");
        }
    }
}

impl Drop for ThreadDelivery {
    fn drop(&mut self) {
        // Closing the channel ends the thread after the queued tasks ran.
        self.sender.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            // Dropped from one of its own tasks: joining would deadlock.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
