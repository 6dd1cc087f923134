//! Error types for replication.

use crate::job::Direction;
use docsync_core::CoreError;
use std::fmt;
use thiserror::Error;

/// Result type for replication operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by replication jobs, the coordinator and the facade.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The endpoint or facade configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The remote could not be reached or failed to answer.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
    },

    /// The remote rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote kept its own revision of these documents.
    #[error("conflict on {} document(s): {}", ids.len(), ids.join(", "))]
    Conflict {
        /// Ids of the conflicting documents.
        ids: Vec<String>,
    },

    /// A replication in this direction is already running.
    #[error("a {direction} replication is already running")]
    Busy {
        /// The direction that is busy.
        direction: Direction,
    },

    /// The remote did not answer in time.
    #[error("operation timed out")]
    Timeout,

    /// Local store or index failure.
    #[error("database error: {0}")]
    Database(#[from] CoreError),

    /// A job was driven through an illegal lifecycle step.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A job ended without reporting an outcome.
    #[error("replication aborted: {0}")]
    Aborted(String),
}

impl SyncError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Returns true if trying again later may succeed.
    ///
    /// Nothing in this crate retries on its own; this is advice for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network { .. } | SyncError::Timeout | SyncError::Busy { .. }
        )
    }

    /// Classifies the error for failure reports.
    pub fn cause(&self) -> FailureCause {
        match self {
            SyncError::Configuration(_) | SyncError::InvalidStateTransition { .. } => {
                FailureCause::Configuration
            }
            SyncError::Network { .. } => FailureCause::Network,
            SyncError::Auth(_) => FailureCause::Auth,
            SyncError::Conflict { .. } => FailureCause::Conflict,
            SyncError::Busy { .. } => FailureCause::Busy,
            SyncError::Timeout => FailureCause::Timeout,
            SyncError::Database(CoreError::Index(_)) => FailureCause::Index,
            SyncError::Database(_) => FailureCause::LocalStore,
            SyncError::Aborted(_) => FailureCause::Aborted,
        }
    }
}

/// Why a replication failed, as carried by failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCause {
    /// Bad endpoint or configuration.
    Configuration,
    /// Remote unreachable or failing.
    Network,
    /// Credentials rejected.
    Auth,
    /// The remote kept divergent revisions.
    Conflict,
    /// Writing to the local store failed.
    LocalStore,
    /// Rebuilding indexes after a pull failed.
    Index,
    /// The remote timed out.
    Timeout,
    /// The direction was already replicating.
    Busy,
    /// The job stopped without an outcome.
    Aborted,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCause::Configuration => "configuration",
            FailureCause::Network => "network",
            FailureCause::Auth => "auth",
            FailureCause::Conflict => "conflict",
            FailureCause::LocalStore => "local-store",
            FailureCause::Index => "index",
            FailureCause::Timeout => "timeout",
            FailureCause::Busy => "busy",
            FailureCause::Aborted => "aborted",
        };
        f.write_str(name)
    }
}
