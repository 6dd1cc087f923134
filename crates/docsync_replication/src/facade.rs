//! The consumer-facing sync facade.

use crate::config::ReplicationConfig;
use crate::coordinator::{ReplicationCoordinator, ReplicationStats};
use crate::dispatch::{Delivery, ThreadDelivery};
use crate::endpoint::Endpoint;
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncObserver, SyncSummary};
use crate::job::{JobId, TransferSummary};
use crate::remote::Remote;
use docsync_core::index::IndexStats;
use docsync_core::{
    body_from_value, split_id, Body, CompactionStats, Document, DocumentId, Filter,
    IndexDefinition, IndexManager, LocalStore, StoreConfig,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone)]
enum Location {
    Directory(PathBuf),
    Memory,
}

/// Assembles a [`SyncedStore`].
///
/// A remote and an endpoint are required. Everything else has a default:
/// an in-memory store, default configs, the current tokio runtime and a
/// dedicated delivery thread.
///
/// ```rust
/// use docsync_replication::{EmbeddedRemote, Endpoint, SyncedStore};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "multi_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = SyncedStore::builder()
///     .in_memory()
///     .endpoint(Endpoint::new("memory://remote", "people"))
///     .remote(Arc::new(EmbeddedRemote::in_memory()))
///     .build()?;
///
/// let saved = store.save_value(json!({"name": "Ada"}))?;
/// assert_eq!(store.fetch(saved.id.as_str())?.body["name"], "Ada");
/// # Ok(())
/// # }
/// ```
pub struct SyncedStoreBuilder {
    location: Location,
    store_config: StoreConfig,
    endpoint: Option<Endpoint>,
    remote: Option<Arc<dyn Remote>>,
    replication_config: ReplicationConfig,
    indexes: Vec<IndexDefinition>,
    runtime: Option<Handle>,
    delivery: Option<Arc<dyn Delivery>>,
}

impl std::fmt::Debug for SyncedStoreBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedStoreBuilder")
            .field("location", &self.location)
            .field("store_config", &self.store_config)
            .field("endpoint", &self.endpoint)
            .field("replication_config", &self.replication_config)
            .field("indexes", &self.indexes)
            .finish_non_exhaustive()
    }
}

impl Default for SyncedStoreBuilder {
    fn default() -> Self {
        Self {
            location: Location::Memory,
            store_config: StoreConfig::default(),
            endpoint: None,
            remote: None,
            replication_config: ReplicationConfig::default(),
            indexes: Vec::new(),
            runtime: None,
            delivery: None,
        }
    }
}

impl SyncedStoreBuilder {
    /// Keeps the store in `path`.
    #[must_use]
    pub fn directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.location = Location::Directory(path.into());
        self
    }

    /// Keeps the store in memory.
    #[must_use]
    pub fn in_memory(mut self) -> Self {
        self.location = Location::Memory;
        self
    }

    /// Sets the store configuration.
    #[must_use]
    pub fn store_config(mut self, config: StoreConfig) -> Self {
        self.store_config = config;
        self
    }

    /// Sets the endpoint to replicate with.
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the remote transport.
    #[must_use]
    pub fn remote(mut self, remote: Arc<dyn Remote>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets batch sizes and event capacity.
    #[must_use]
    pub fn replication_config(mut self, config: ReplicationConfig) -> Self {
        self.replication_config = config;
        self
    }

    /// Declares an index in addition to the default one.
    #[must_use]
    pub fn index(mut self, definition: IndexDefinition) -> Self {
        self.indexes.push(definition);
        self
    }

    /// Runs replication on `runtime` instead of the current one.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Delivers completions and events on `delivery`.
    #[must_use]
    pub fn delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Opens the store, builds the indexes and wires up replication.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Configuration`] for a missing or invalid endpoint, a
    ///   missing remote, or no tokio runtime
    /// - [`SyncError::Database`] if the store cannot be opened or the
    ///   indexes cannot be declared or built
    pub fn build(self) -> SyncResult<SyncedStore> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| SyncError::configuration("an endpoint is required"))?;
        endpoint.validate()?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::configuration("a remote is required"))?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| SyncError::configuration(format!("no tokio runtime: {e}")))?,
        };
        let delivery: Arc<dyn Delivery> = match self.delivery {
            Some(delivery) => delivery,
            None => Arc::new(ThreadDelivery::new()?),
        };

        let store = match &self.location {
            Location::Directory(path) => LocalStore::open(path, self.store_config)?,
            Location::Memory => LocalStore::in_memory(self.store_config)?,
        };
        let store = Arc::new(store);

        let indexes = Arc::new(IndexManager::new(Arc::clone(&store)));
        indexes.ensure_index(IndexDefinition::default_index())?;
        for definition in self.indexes {
            indexes.ensure_index(definition)?;
        }
        let report = indexes.update_all_indexes()?;

        info!(
            endpoint = %endpoint,
            documents = report.documents,
            indexes = indexes.definitions().len(),
            "synced store ready"
        );

        let coordinator = ReplicationCoordinator::new(
            Arc::clone(&store),
            remote,
            endpoint,
            self.replication_config,
            runtime,
            delivery,
        );

        Ok(SyncedStore {
            store,
            indexes,
            coordinator,
        })
    }
}

/// A local store kept indexed and replicated with one remote endpoint.
///
/// Writes go to the local store and are indexed before they return, so a
/// query issued after [`save`](Self::save) sees the saved document. Pulled
/// documents are indexed before a pull or sync reports completion. Nothing
/// is pushed until [`push`](Self::push) or [`sync`](Self::sync) is called.
#[derive(Debug, Clone)]
pub struct SyncedStore {
    store: Arc<LocalStore>,
    indexes: Arc<IndexManager>,
    coordinator: ReplicationCoordinator,
}

impl SyncedStore {
    /// Starts building a store.
    #[must_use]
    pub fn builder() -> SyncedStoreBuilder {
        SyncedStoreBuilder::default()
    }

    /// Saves `body` under its `_id`, or a fresh id if it has none.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Database`] if the body is invalid, the write
    /// fails or the indexes cannot be rebuilt. A body that would duplicate
    /// the key of a unique index is refused before anything is written.
    pub fn save(&self, body: Body) -> SyncResult<Document> {
        let (id, body) = split_id(body)?;
        self.store.put(&id, body)?;
        self.indexes.update_all_indexes()?;
        Ok(self.store.get(&id)?)
    }

    /// Saves a JSON object. See [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Same as [`save`](Self::save); a non-object value is invalid.
    pub fn save_value(&self, value: Value) -> SyncResult<Document> {
        self.save(body_from_value(value)?)
    }

    /// Returns the current revision of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Database`] wrapping `NotFound` for an unknown id.
    pub fn fetch(&self, id: &str) -> SyncResult<Document> {
        let id = DocumentId::new(id)?;
        Ok(self.store.get(&id)?)
    }

    /// Returns the documents matching `filter`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Database`] if the indexes are unusable.
    pub fn query(&self, filter: &Filter) -> SyncResult<Vec<Document>> {
        Ok(self.indexes.query(filter)?)
    }

    /// Parses a JSON filter and runs it. See [`Filter::from_json`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Database`] for a malformed filter.
    pub fn query_json(&self, filter: &Value) -> SyncResult<Vec<Document>> {
        let filter = Filter::from_json(filter).map_err(docsync_core::CoreError::from)?;
        self.query(&filter)
    }

    /// Declares an index and rebuilds so it is immediately queryable.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Database`] for an invalid or conflicting
    /// definition, or if the rebuild fails.
    pub fn ensure_indexed<I, S>(&self, fields: I, name: &str) -> SyncResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes.ensure_indexed(fields, name)?;
        self.indexes.update_all_indexes()?;
        Ok(())
    }

    /// Pulls from the remote; pulled documents are indexed before
    /// `on_complete` runs.
    ///
    /// # Errors
    ///
    /// [`SyncError::Busy`] if a pull is outstanding.
    pub fn pull<F>(&self, on_complete: F) -> SyncResult<JobId>
    where
        F: FnOnce(&TransferSummary) + Send + 'static,
    {
        self.coordinator.pull_with(self.reindex(), on_complete)
    }

    /// Pushes local changes to the remote.
    ///
    /// # Errors
    ///
    /// [`SyncError::Busy`] if a push is outstanding.
    pub fn push<F>(&self, on_complete: F) -> SyncResult<JobId>
    where
        F: FnOnce(&TransferSummary) + Send + 'static,
    {
        self.coordinator.push(on_complete)
    }

    /// Pulls, reindexes, then pushes. `on_complete` runs only if every
    /// step succeeded.
    ///
    /// # Errors
    ///
    /// [`SyncError::Busy`] if a pull is outstanding.
    pub fn sync<F>(&self, on_complete: F) -> SyncResult<JobId>
    where
        F: FnOnce(&SyncSummary) + Send + 'static,
    {
        self.coordinator.sync_with(self.reindex(), on_complete)
    }

    fn reindex(&self) -> impl FnOnce() -> SyncResult<()> + Send + 'static {
        let indexes = Arc::clone(&self.indexes);
        move || {
            indexes.update_all_indexes()?;
            Ok(())
        }
    }

    /// Subscribes to sync events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe()
    }

    /// Registers an observer called on the delivery context.
    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.coordinator.add_observer(observer);
    }

    /// Returns replication counters.
    pub fn stats(&self) -> ReplicationStats {
        self.coordinator.stats()
    }

    /// Returns index counters.
    pub fn index_stats(&self) -> IndexStats {
        self.indexes.stats()
    }

    /// Compacts the store log.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Database`] if the log cannot be rewritten.
    pub fn compact(&self) -> SyncResult<CompactionStats> {
        Ok(self.store.compact()?)
    }

    /// Returns the local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Returns the index manager.
    pub fn indexes(&self) -> &Arc<IndexManager> {
        &self.indexes
    }

    /// Returns the replication coordinator.
    pub fn coordinator(&self) -> &ReplicationCoordinator {
        &self.coordinator
    }
}
