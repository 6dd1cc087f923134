//! Error types for the local store and index manager.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the local store and the index manager.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] docsync_storage::StorageError),

    /// I/O error outside the storage backend (directory handling).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A log record could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The document log is unreadable beyond repair.
    #[error("log corruption: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// No document with this id exists.
    #[error("document not found: {id}")]
    NotFound {
        /// The id that was looked up.
        id: String,
    },

    /// A document id or body was rejected.
    #[error("invalid document: {message}")]
    InvalidDocument {
        /// Why the document was rejected.
        message: String,
    },

    /// Another process owns the store directory.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Index definition, build or query failure.
    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates an invalid document error.
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if this error comes from the durable medium rather than
    /// from the caller's input.
    #[must_use]
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            CoreError::Storage(_)
                | CoreError::Io(_)
                | CoreError::Codec { .. }
                | CoreError::Corrupted { .. }
                | CoreError::StoreLocked
        )
    }
}

/// Errors raised while declaring, building or querying indexes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// `query` was called before any build completed.
    #[error("indexes have not been built yet")]
    NotBuilt,

    /// The definition has no name or no fields.
    #[error("invalid index definition: {0}")]
    InvalidDefinition(String),

    /// An index with this name exists with different fields.
    #[error("index '{name}' is already declared with different fields")]
    DefinitionConflict {
        /// Name of the index.
        name: String,
    },

    /// Two documents share a key in a unique index.
    #[error("unique index '{index}' has duplicate key {key} (documents {first} and {second})")]
    UniqueViolation {
        /// Name of the index.
        index: String,
        /// Rendered key.
        key: String,
        /// First document holding the key.
        first: String,
        /// Second document holding the key.
        second: String,
    },

    /// The filter cannot be evaluated.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::not_found("ada");
        assert_eq!(err.to_string(), "document not found: ada");

        let err = CoreError::from(IndexError::NotBuilt);
        assert_eq!(
            err.to_string(),
            "index error: indexes have not been built yet"
        );
    }

    #[test]
    fn storage_failures_are_classified() {
        assert!(CoreError::StoreLocked.is_storage_failure());
        assert!(CoreError::corrupted("bad crc").is_storage_failure());
        assert!(!CoreError::not_found("x").is_storage_failure());
        assert!(!CoreError::from(IndexError::NotBuilt).is_storage_failure());
    }
}
