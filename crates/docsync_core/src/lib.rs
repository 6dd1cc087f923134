//! # docsync core
//!
//! Local document store and secondary indexes.
//!
//! This crate provides:
//! - [`LocalStore`]: a durable, single-directory document store with
//!   revision tracking, a change feed and replication checkpoints
//! - [`IndexManager`]: declared secondary indexes rebuilt from store
//!   snapshots, queried with [`Filter`]s
//! - the document model ([`Document`], [`DocumentId`], [`Revision`]) and
//!   the last-write-wins [`resolve`] rule used by replication
//!
//! ## Quick start
//!
//! ```rust
//! use docsync_core::{split_id, body_from_value, LocalStore, StoreConfig};
//! use serde_json::json;
//!
//! let store = LocalStore::in_memory(StoreConfig::default()).unwrap();
//! let body = body_from_value(json!({"_id": "ada", "name": "Ada"})).unwrap();
//! let (id, body) = split_id(body).unwrap();
//!
//! store.put(&id, body).unwrap();
//! assert_eq!(store.get(&id).unwrap().body["name"], "Ada");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dir;
mod document;
mod error;
pub mod index;
mod log;
mod revision;
mod store;

pub use config::StoreConfig;
pub use dir::StoreDir;
pub use document::{
    body_from_value, split_id, Body, Document, DocumentId, ReplicatedDocument, ID_FIELD,
    REV_FIELD,
};
pub use error::{CoreError, CoreResult, IndexError};
pub use index::{Filter, IndexDefinition, IndexManager, Predicate, DEFAULT_INDEX};
pub use revision::{resolve, Resolution, Revision};
pub use store::{
    AllDocuments, Change, ChangeBatch, CompactionStats, LocalStore, Sequence, StoreSnapshot,
    WriteCheck,
};
