//! Local store configuration.

/// Configuration for opening a [`crate::LocalStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to `fsync` the log after every write (safer but slower).
    pub sync_on_write: bool,

    /// Number of ancestor revisions kept per document for replication.
    pub revision_history_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_write: true,
            revision_history_limit: 64,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the log on every write.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets how many ancestor revisions are kept per document.
    ///
    /// A limit of zero is raised to one: replication needs at least the
    /// direct parent to recognise a fast-forward.
    #[must_use]
    pub fn revision_history_limit(mut self, limit: usize) -> Self {
        self.revision_history_limit = limit.max(1);
        self
    }
}
