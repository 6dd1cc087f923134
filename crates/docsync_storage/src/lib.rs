//! # docsync storage
//!
//! Byte-level storage for the docsync document log.
//!
//! Backends are **opaque append-only byte stores**: they know nothing about
//! documents, revisions or checkpoints. `docsync_core` owns the record
//! framing written on top of them.
//!
//! ## Backends
//!
//! - [`FileBackend`] - a single file on disk, used by directory-backed stores
//! - [`InMemoryBackend`] - volatile storage for tests and ephemeral stores,
//!   with write-failure injection
//!
//! ## Example
//!
//! ```rust
//! use docsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"record").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"record");
//! assert_eq!(backend.read_all().unwrap(), b"record");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::{InMemoryBackend, WriteFailureSwitch};
