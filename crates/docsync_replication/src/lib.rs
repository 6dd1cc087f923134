//! # docsync replication
//!
//! Replication between a [`docsync_core::LocalStore`] and a remote
//! document store, and the [`SyncedStore`] facade consumers use.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  save/fetch/query   ┌──────────────┐
//! │  SyncedStore  │────────────────────▶│  LocalStore  │◀──┐
//! └──────┬────────┘                     │ IndexManager │   │ apply / read
//!        │ pull/push/sync               └──────────────┘   │
//! ┌──────▼─────────────────┐  start   ┌────────────────┐   │
//! │ ReplicationCoordinator │─────────▶│ ReplicationJob │───┘
//! └──────┬─────────────────┘          └───────┬────────┘
//!        │ completions, events                │ changes / bulk_docs
//! ┌──────▼──────┐                      ┌──────▼──────┐
//! │  Delivery   │                      │   Remote    │
//! └─────────────┘                      └─────────────┘
//! ```
//!
//! Jobs run on the tokio blocking pool. Everything a consumer observes
//! (completion callbacks, [`SyncEvent`]s, failure reports) runs on one
//! serial [`Delivery`] context.
//!
//! ## Example
//!
//! ```rust
//! use docsync_replication::{EmbeddedRemote, Endpoint, SyncEvent, SyncedStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "multi_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let remote = Arc::new(EmbeddedRemote::in_memory());
//! let store = SyncedStore::builder()
//!     .endpoint(Endpoint::new("memory://remote", "people"))
//!     .remote(remote)
//!     .build()?;
//!
//! store.save_value(json!({"_id": "ada", "name": "Ada"}))?;
//!
//! let mut events = store.subscribe();
//! store.sync(|summary| println!("pushed {}", summary.pushed.documents_written))?;
//! loop {
//!     if let SyncEvent::SyncCompleted(_) = events.recv().await? {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod dispatch;
mod endpoint;
mod error;
mod events;
mod facade;
mod job;
mod remote;

pub use config::ReplicationConfig;
pub use coordinator::{ReplicationCoordinator, ReplicationStats};
pub use dispatch::{Delivery, Task, ThreadDelivery};
pub use endpoint::{Credentials, Endpoint, SUPPORTED_SCHEMES};
pub use error::{FailureCause, SyncError, SyncResult};
pub use events::{EventBus, SyncEvent, SyncObserver, SyncSummary};
pub use facade::{SyncedStore, SyncedStoreBuilder};
pub use job::{
    Direction, JobId, JobInfo, JobOutcome, JobProgress, JobState, ReplicationJob, TransferSummary,
};
pub use remote::{BulkDocsResponse, ChangesResponse, EmbeddedRemote, Fault, Remote, RemoteStats};
