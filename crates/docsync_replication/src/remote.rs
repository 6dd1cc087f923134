//! Remote document store abstraction.

use crate::endpoint::{Credentials, Endpoint};
use crate::error::{SyncError, SyncResult};
use docsync_core::{LocalStore, ReplicatedDocument, Resolution, StoreConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A page of remote changes.
#[derive(Debug, Clone, Default)]
pub struct ChangesResponse {
    /// Documents changed after the requested sequence, in remote order.
    pub documents: Vec<ReplicatedDocument>,
    /// Remote sequence to resume from.
    pub last_sequence: u64,
    /// True if more changes are waiting.
    pub pending: bool,
}

/// Result of sending documents to a remote.
#[derive(Debug, Clone, Default)]
pub struct BulkDocsResponse {
    /// Documents the remote stored.
    pub written: usize,
    /// Documents the remote rejected because it holds a winning revision.
    pub conflicts: Vec<String>,
}

/// A remote document store.
///
/// This trait abstracts the transport. Calls block; replication jobs run
/// them off the caller's thread. Implementations report transport trouble
/// as [`SyncError::Network`] or [`SyncError::Timeout`] and rejected
/// credentials as [`SyncError::Auth`].
pub trait Remote: Send + Sync {
    /// Checks the endpoint's credentials.
    fn authenticate(&self, endpoint: &Endpoint) -> SyncResult<()>;

    /// Returns up to `limit` documents changed after remote sequence `since`.
    fn changes(&self, database: &str, since: u64, limit: usize) -> SyncResult<ChangesResponse>;

    /// Offers documents to the remote.
    fn bulk_docs(
        &self,
        database: &str,
        documents: Vec<ReplicatedDocument>,
    ) -> SyncResult<BulkDocsResponse>;
}

/// A failure an [`EmbeddedRemote`] can be told to simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every request fails with a network error.
    Unreachable,
    /// Every request fails with a timeout.
    Timeout,
}

/// Request counters of an [`EmbeddedRemote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    /// `authenticate` calls.
    pub authentications: u64,
    /// `changes` calls.
    pub changes_requests: u64,
    /// `bulk_docs` calls.
    pub bulk_requests: u64,
}

#[derive(Debug, Default)]
struct Counters {
    authentications: AtomicU64,
    changes_requests: AtomicU64,
    bulk_requests: AtomicU64,
}

/// A remote served from local stores in this process.
///
/// Each database is a [`LocalStore`], kept in memory or in one
/// subdirectory per database. The remote applies pushed revisions with
/// the same resolution rule replicas use, so it behaves like a real
/// document server for replication purposes. Faults and latency can be
/// injected for testing.
///
/// # Example
///
/// ```rust
/// use docsync_replication::{Endpoint, EmbeddedRemote, Fault, Remote};
///
/// let remote = EmbeddedRemote::in_memory().with_credentials("key", "secret");
/// let endpoint = Endpoint::new("memory://remote", "people").with_credentials("key", "secret");
/// assert!(remote.authenticate(&endpoint).is_ok());
///
/// remote.inject_fault(Some(Fault::Unreachable));
/// assert!(remote.authenticate(&endpoint).is_err());
/// ```
#[derive(Debug)]
pub struct EmbeddedRemote {
    root: Option<PathBuf>,
    databases: Mutex<HashMap<String, Arc<LocalStore>>>,
    credentials: Option<Credentials>,
    fault: RwLock<Option<Fault>>,
    latency: RwLock<Duration>,
    counters: Counters,
}

impl EmbeddedRemote {
    /// Creates a remote whose databases live in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_root(None)
    }

    /// Creates a remote keeping each database in a subdirectory of `root`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `root` cannot be created.
    pub fn open_dir(root: impl Into<PathBuf>) -> SyncResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            SyncError::configuration(format!("cannot create {}: {e}", root.display()))
        })?;
        Ok(Self::with_root(Some(root)))
    }

    fn with_root(root: Option<PathBuf>) -> Self {
        Self {
            root,
            databases: Mutex::new(HashMap::new()),
            credentials: None,
            fault: RwLock::new(None),
            latency: RwLock::new(Duration::ZERO),
            counters: Counters::default(),
        }
    }

    /// Requires these credentials from every client.
    #[must_use]
    pub fn with_credentials(mut self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(key, secret));
        self
    }

    /// Starts (or with `None`, stops) simulating a failure.
    pub fn inject_fault(&self, fault: Option<Fault>) {
        *self.fault.write() = fault;
    }

    /// Delays every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Returns the request counters.
    pub fn stats(&self) -> RemoteStats {
        RemoteStats {
            authentications: self.counters.authentications.load(Ordering::SeqCst),
            changes_requests: self.counters.changes_requests.load(Ordering::SeqCst),
            bulk_requests: self.counters.bulk_requests.load(Ordering::SeqCst),
        }
    }

    /// Returns the store behind `name`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Database`] if the database cannot be opened.
    pub fn database(&self, name: &str) -> SyncResult<Arc<LocalStore>> {
        let mut databases = self.databases.lock();
        if let Some(store) = databases.get(name) {
            return Ok(Arc::clone(store));
        }

        let store = match &self.root {
            Some(root) => {
                let dir = root.join(name.replace('/', "%2F"));
                LocalStore::open(&dir, StoreConfig::default())?
            }
            None => LocalStore::in_memory(StoreConfig::default())?,
        };
        let store = Arc::new(store);
        databases.insert(name.to_string(), Arc::clone(&store));
        debug!(database = name, "opened remote database");
        Ok(store)
    }

    fn simulate_transport(&self) -> SyncResult<()> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        match *self.fault.read() {
            Some(Fault::Unreachable) => Err(SyncError::network("remote unreachable")),
            Some(Fault::Timeout) => Err(SyncError::Timeout),
            None => Ok(()),
        }
    }

    fn served_database(&self, name: &str) -> SyncResult<Arc<LocalStore>> {
        self.database(name)
            .map_err(|e| SyncError::network(format!("remote database {name} failed: {e}")))
    }
}

impl Remote for EmbeddedRemote {
    fn authenticate(&self, endpoint: &Endpoint) -> SyncResult<()> {
        self.counters.authentications.fetch_add(1, Ordering::SeqCst);
        self.simulate_transport()?;

        match (&self.credentials, endpoint.credentials()) {
            (None, _) => Ok(()),
            (Some(expected), Some(given)) if expected == given => Ok(()),
            (Some(_), Some(given)) => Err(SyncError::auth(format!(
                "invalid credentials for key {:?}",
                given.key
            ))),
            (Some(_), None) => Err(SyncError::auth("credentials required")),
        }
    }

    fn changes(&self, database: &str, since: u64, limit: usize) -> SyncResult<ChangesResponse> {
        self.counters.changes_requests.fetch_add(1, Ordering::SeqCst);
        self.simulate_transport()?;

        let batch = self.served_database(database)?.changes_since(since, limit);
        Ok(ChangesResponse {
            documents: batch.changes.into_iter().map(|c| c.document).collect(),
            last_sequence: batch.last_sequence,
            pending: batch.pending,
        })
    }

    fn bulk_docs(
        &self,
        database: &str,
        documents: Vec<ReplicatedDocument>,
    ) -> SyncResult<BulkDocsResponse> {
        self.counters.bulk_requests.fetch_add(1, Ordering::SeqCst);
        self.simulate_transport()?;

        let store = self.served_database(database)?;
        let mut response = BulkDocsResponse::default();
        for document in documents {
            let id = document.id().to_string();
            let resolution = store
                .apply_replicated(document)
                .map_err(|e| SyncError::network(format!("remote rejected {id}: {e}")))?;
            match resolution {
                Resolution::Superseded => response.conflicts.push(id),
                r if r.applies() => response.written += 1,
                _ => {}
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{body_from_value, DocumentId};
    use serde_json::json;

    fn endpoint() -> Endpoint {
        Endpoint::new("memory://remote", "people").with_credentials("key", "secret")
    }

    #[test]
    fn credentials_are_checked() {
        let remote = EmbeddedRemote::in_memory().with_credentials("key", "secret");
        assert!(remote.authenticate(&endpoint()).is_ok());

        let wrong = Endpoint::new("memory://remote", "people").with_credentials("key", "nope");
        assert!(matches!(
            remote.authenticate(&wrong),
            Err(SyncError::Auth(_))
        ));
        let anonymous = Endpoint::new("memory://remote", "people");
        assert!(remote.authenticate(&anonymous).is_err());
    }

    #[test]
    fn faults_map_to_errors() {
        let remote = EmbeddedRemote::in_memory();
        remote.inject_fault(Some(Fault::Unreachable));
        assert!(matches!(
            remote.changes("people", 0, 10),
            Err(SyncError::Network { .. })
        ));
        remote.inject_fault(Some(Fault::Timeout));
        assert!(matches!(
            remote.bulk_docs("people", Vec::new()),
            Err(SyncError::Timeout)
        ));
        remote.inject_fault(None);
        assert!(remote.changes("people", 0, 10).is_ok());
        assert_eq!(remote.stats().changes_requests, 2);
    }

    #[test]
    fn bulk_docs_reports_conflicts() {
        let remote = EmbeddedRemote::in_memory();
        let people = remote.database("people").unwrap();
        let id = DocumentId::new("ada").unwrap();
        people
            .put(&id, body_from_value(json!({"v": 1})).unwrap())
            .unwrap();
        people
            .put(&id, body_from_value(json!({"v": 2})).unwrap())
            .unwrap();

        let client = LocalStore::in_memory(StoreConfig::default()).unwrap();
        client
            .put(&id, body_from_value(json!({"v": "local"})).unwrap())
            .unwrap();
        let fresh = DocumentId::new("bob").unwrap();
        client
            .put(&fresh, body_from_value(json!({})).unwrap())
            .unwrap();

        let docs = vec![
            client.replicated(&id).unwrap(),
            client.replicated(&fresh).unwrap(),
        ];
        let response = remote.bulk_docs("people", docs).unwrap();
        assert_eq!(response.conflicts, ["ada"]);
        assert_eq!(response.written, 1);

        let changes = remote.changes("people", 0, 10).unwrap();
        assert_eq!(changes.documents.len(), 2);
        assert!(!changes.pending);
    }

    #[test]
    fn directory_databases_persist() {
        let temp = tempfile::tempdir().unwrap();
        let id = DocumentId::new("ada").unwrap();
        {
            let remote = EmbeddedRemote::open_dir(temp.path()).unwrap();
            remote
                .database("team/people")
                .unwrap()
                .put(&id, body_from_value(json!({"name": "Ada"})).unwrap())
                .unwrap();
        }

        let remote = EmbeddedRemote::open_dir(temp.path()).unwrap();
        assert!(remote.database("team/people").unwrap().contains(&id));
    }
}
