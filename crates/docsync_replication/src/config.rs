//! Configuration for replication.

/// Batch sizes and channel capacities used by replication jobs.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Documents requested per pull batch.
    pub pull_batch_size: usize,
    /// Documents sent per push batch.
    pub push_batch_size: usize,
    /// Events buffered per subscriber before slow subscribers lag.
    pub event_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            pull_batch_size: 100,
            push_batch_size: 100,
            event_capacity: 64,
        }
    }
}

impl ReplicationConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pull batch size (at least 1).
    #[must_use]
    pub const fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = if size == 0 { 1 } else { size };
        self
    }

    /// Sets the push batch size (at least 1).
    #[must_use]
    pub const fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = if size == 0 { 1 } else { size };
        self
    }

    /// Sets the event buffer per subscriber (at least 1).
    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = if capacity == 0 { 1 } else { capacity };
        self
    }
}
