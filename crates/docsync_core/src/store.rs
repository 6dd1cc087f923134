//! The local document store.

use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::document::{Body, Document, DocumentId, ReplicatedDocument, ID_FIELD, REV_FIELD};
use crate::error::{CoreError, CoreResult};
use crate::log::{self, LogEntry};
use crate::revision::{resolve, Resolution, Revision};
use docsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Local change sequence. Every accepted write takes the next value.
pub type Sequence = u64;

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Sequence of the write that made this revision current.
    pub sequence: Sequence,
    /// The document as it is now, with its ancestry.
    pub document: ReplicatedDocument,
}

/// A page of the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    /// Changes in ascending sequence order.
    pub changes: Vec<Change>,
    /// Sequence to resume from: the last change returned, or the requested
    /// starting point if the page is empty.
    pub last_sequence: Sequence,
    /// True if more changes exist beyond this page.
    pub pending: bool,
}

/// Vetoes writes before they reach the log.
///
/// Checks run while the store holds its write lock, so `current` is exactly
/// the state the write would land on and no other write can slip in
/// between the check and the append.
pub trait WriteCheck: Send + Sync {
    /// Returns an error to refuse `candidate`.
    ///
    /// `current` yields every stored document, including the revision of
    /// `candidate` that is about to be replaced.
    ///
    /// # Errors
    ///
    /// Any error; it is returned unchanged from the refused write.
    fn check(
        &self,
        candidate: &Document,
        current: &mut dyn Iterator<Item = &Document>,
    ) -> CoreResult<()>;
}

/// A consistent copy of every current document.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    /// Last sequence included in the snapshot.
    pub sequence: Sequence,
    /// Documents ordered by id.
    pub documents: Vec<Document>,
}

/// Sizes reported by [`LocalStore::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Log size before compaction, in bytes.
    pub bytes_before: u64,
    /// Log size after compaction, in bytes.
    pub bytes_after: u64,
    /// Documents rewritten.
    pub documents: usize,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    sequence: Sequence,
    replicated: ReplicatedDocument,
}

#[derive(Debug, Default)]
struct StoreState {
    documents: BTreeMap<DocumentId, StoredDocument>,
    by_sequence: BTreeMap<Sequence, DocumentId>,
    checkpoints: HashMap<String, Sequence>,
    last_sequence: Sequence,
}

impl StoreState {
    fn apply(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Document { sequence, document } => {
                let id = document.id().clone();
                if let Some(previous) = self.documents.get(&id) {
                    self.by_sequence.remove(&previous.sequence);
                }
                self.by_sequence.insert(sequence, id.clone());
                self.documents.insert(
                    id,
                    StoredDocument {
                        sequence,
                        replicated: document,
                    },
                );
                self.last_sequence = self.last_sequence.max(sequence);
            }
            LogEntry::Checkpoint { name, sequence } => {
                self.checkpoints.insert(name, sequence);
            }
        }
    }
}

/// A durable, single-process document store.
///
/// Every write is appended to a log before it becomes visible, so a write
/// that returned `Ok` survives a crash and a write that returned `Err`
/// left no trace. Reads are served from memory.
///
/// The store is the only component allowed to write documents; indexes and
/// replication jobs read from it or hand it replicated revisions through
/// [`LocalStore::apply_replicated`].
///
/// # Opening a store
///
/// ```rust
/// use docsync_core::{DocumentId, LocalStore, StoreConfig};
/// use serde_json::json;
///
/// let store = LocalStore::in_memory(StoreConfig::default()).unwrap();
/// let id = DocumentId::new("ada").unwrap();
/// let body = docsync_core::body_from_value(json!({"name": "Ada"})).unwrap();
///
/// let revision = store.put(&id, body).unwrap();
/// assert_eq!(store.get(&id).unwrap().revision, revision);
/// ```
///
/// # Concurrency
///
/// The store is `Send + Sync`. Writers are serialized. A write holds the
/// state lock until its log append and sync return, so readers wait for
/// the whole durable write, not just for it to publish.
pub struct LocalStore {
    config: StoreConfig,
    /// Holds the directory lock. None for in-memory stores.
    dir: Option<StoreDir>,
    log: Mutex<Box<dyn StorageBackend>>,
    state: RwLock<StoreState>,
    write_checks: Mutex<Vec<Weak<dyn WriteCheck>>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path())
            .field("documents", &self.len())
            .field("last_sequence", &self.last_sequence())
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Opens the store kept in directory `path`.
    ///
    /// The directory is created if missing (unless disabled in `config`)
    /// and locked for the lifetime of the store. The log is replayed; a torn
    /// tail left by a crash is cut off with a warning.
    ///
    /// # Errors
    ///
    /// - [`CoreError::StoreLocked`] if another handle owns the directory
    /// - [`CoreError::Corrupted`] if the log is not a document log
    /// - I/O and storage errors
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        if dir.remove_stale_compaction()? {
            warn!(path = %path.display(), "removed leftover compaction file");
        }
        let backend = FileBackend::open(&dir.log_path())?;
        Self::from_parts(Box::new(backend), config, Some(dir))
    }

    /// Creates an empty store that lives only in memory.
    ///
    /// # Errors
    ///
    /// Returns an error only if the log header cannot be written.
    pub fn in_memory(config: StoreConfig) -> CoreResult<Self> {
        Self::with_backend(Box::new(InMemoryBackend::new()), config)
    }

    /// Opens a store over an arbitrary backend.
    ///
    /// Used to recover from preloaded bytes and to inject storage failures.
    ///
    /// # Errors
    ///
    /// Same as [`LocalStore::open`], minus the directory errors.
    pub fn with_backend(backend: Box<dyn StorageBackend>, config: StoreConfig) -> CoreResult<Self> {
        Self::from_parts(backend, config, None)
    }

    fn from_parts(
        mut backend: Box<dyn StorageBackend>,
        config: StoreConfig,
        dir: Option<StoreDir>,
    ) -> CoreResult<Self> {
        let bytes = backend.read_all()?;
        let replay = log::replay(&bytes)?;

        if let Some(reason) = &replay.torn_tail {
            warn!(
                %reason,
                discarded = bytes.len() as u64 - replay.valid_len,
                "truncating torn tail of document log"
            );
            backend.truncate(replay.valid_len)?;
            backend.sync()?;
        }
        if replay.valid_len == 0 {
            backend.append(&log::file_header())?;
            backend.sync()?;
        }

        let mut state = StoreState::default();
        for entry in replay.entries {
            state.apply(entry);
        }

        info!(
            documents = state.documents.len(),
            last_sequence = state.last_sequence,
            persistent = dir.is_some(),
            "opened local store"
        );

        Ok(Self {
            config,
            dir,
            log: Mutex::new(backend),
            state: RwLock::new(state),
            write_checks: Mutex::new(Vec::new()),
        })
    }

    /// Returns the store directory, or `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(StoreDir::path)
    }

    /// Returns the configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Creates or updates the document `id` and returns its new revision.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidDocument`] if the body uses a reserved field
    ///   name (`_id`, `_rev`) or an empty field name
    /// - any error of a registered [`WriteCheck`], e.g.
    ///   [`IndexError::UniqueViolation`](crate::IndexError::UniqueViolation)
    /// - a storage error if the write could not be made durable
    ///
    /// The store is unchanged whenever an error is returned.
    pub fn put(&self, id: &DocumentId, body: Body) -> CoreResult<Revision> {
        validate_body(&body)?;

        let mut state = self.state.write();
        let previous = state.documents.get(id).map(|stored| &stored.replicated);

        let ancestors = match previous {
            Some(previous) => {
                let mut ancestors = Vec::with_capacity(previous.ancestors.len() + 1);
                ancestors.push(previous.revision().clone());
                ancestors.extend(previous.ancestors.iter().cloned());
                ancestors.truncate(self.config.revision_history_limit);
                ancestors
            }
            None => Vec::new(),
        };
        let revision = Revision::next(previous.map(ReplicatedDocument::revision), &body);

        let document = ReplicatedDocument {
            document: Document {
                id: id.clone(),
                revision: revision.clone(),
                body,
            },
            ancestors,
        };
        self.run_write_checks(&state, &document.document)?;

        let sequence = state.last_sequence + 1;
        let entry = LogEntry::Document { sequence, document };
        self.append(&entry)?;
        state.apply(entry);

        debug!(%id, %revision, sequence, "saved document");
        Ok(revision)
    }

    /// Returns the current revision of document `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if no such document exists.
    pub fn get(&self, id: &DocumentId) -> CoreResult<Document> {
        self.state
            .read()
            .documents
            .get(id)
            .map(|stored| stored.replicated.document.clone())
            .ok_or_else(|| CoreError::not_found(id.as_str()))
    }

    /// Returns true if a document with this id exists.
    #[must_use]
    pub fn contains(&self, id: &DocumentId) -> bool {
        self.state.read().documents.contains_key(id)
    }

    /// Iterates over every current document in id order.
    ///
    /// The iterator reads lazily and holds no lock between items: it sees
    /// writes made while it is in progress for ids it has not reached yet.
    /// Call `all` again to restart from the beginning.
    #[must_use]
    pub fn all(&self) -> AllDocuments<'_> {
        AllDocuments {
            store: self,
            after: None,
            finished: false,
        }
    }

    /// Returns the number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().documents.len()
    }

    /// Returns true if the store holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the sequence of the most recent write (0 when empty).
    #[must_use]
    pub fn last_sequence(&self) -> Sequence {
        self.state.read().last_sequence
    }

    /// Copies every current document under one read lock.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read();
        StoreSnapshot {
            sequence: state.last_sequence,
            documents: state
                .documents
                .values()
                .map(|stored| stored.replicated.document.clone())
                .collect(),
        }
    }

    /// Returns up to `limit` documents whose current revision was written
    /// after `since`, in sequence order.
    ///
    /// A document edited several times appears once, at its latest sequence.
    #[must_use]
    pub fn changes_since(&self, since: Sequence, limit: usize) -> ChangeBatch {
        let state = self.state.read();
        let mut range = state
            .by_sequence
            .range((Bound::Excluded(since), Bound::Unbounded));

        let mut changes = Vec::new();
        for (sequence, id) in range.by_ref().take(limit.max(1)) {
            if let Some(stored) = state.documents.get(id) {
                changes.push(Change {
                    sequence: *sequence,
                    document: stored.replicated.clone(),
                });
            }
        }
        let pending = range.next().is_some();

        ChangeBatch {
            last_sequence: changes.last().map_or(since, |change| change.sequence),
            changes,
            pending,
        }
    }

    /// Returns the document with its ancestry, as sent to a remote.
    #[must_use]
    pub fn replicated(&self, id: &DocumentId) -> Option<ReplicatedDocument> {
        self.state
            .read()
            .documents
            .get(id)
            .map(|stored| stored.replicated.clone())
    }

    /// Offers a revision received from a remote.
    ///
    /// The incoming document replaces the local one when it is new, a
    /// descendant, or the winner of a divergent edit (see
    /// [`crate::resolve`]). Otherwise nothing is written.
    ///
    /// # Errors
    ///
    /// - an error of a registered [`WriteCheck`] refusing an accepted
    ///   revision; nothing is written
    /// - a storage error if an accepted revision could not be written
    pub fn apply_replicated(&self, mut incoming: ReplicatedDocument) -> CoreResult<Resolution> {
        validate_body(&incoming.document.body)?;

        let mut state = self.state.write();
        let current = state.documents.get(incoming.id()).map(|s| &s.replicated);
        let resolution = resolve(current, &incoming);
        if !resolution.applies() {
            return Ok(resolution);
        }

        self.run_write_checks(&state, &incoming.document)?;

        incoming
            .ancestors
            .truncate(self.config.revision_history_limit);
        let sequence = state.last_sequence + 1;
        let id = incoming.id().clone();
        let revision = incoming.revision().clone();
        let entry = LogEntry::Document {
            sequence,
            document: incoming,
        };
        self.append(&entry)?;
        state.apply(entry);

        debug!(%id, %revision, sequence, ?resolution, "applied replicated document");
        Ok(resolution)
    }

    /// Returns the checkpoint stored under `name`, or 0.
    #[must_use]
    pub fn checkpoint(&self, name: &str) -> Sequence {
        self.state
            .read()
            .checkpoints
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Durably records checkpoint `name`.
    ///
    /// Writing the value already stored is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the checkpoint could not be written.
    pub fn set_checkpoint(&self, name: &str, sequence: Sequence) -> CoreResult<()> {
        let mut state = self.state.write();
        if state.checkpoints.get(name) == Some(&sequence) {
            return Ok(());
        }
        let entry = LogEntry::Checkpoint {
            name: name.to_string(),
            sequence,
        };
        self.append(&entry)?;
        state.apply(entry);
        Ok(())
    }

    /// Rewrites the log so it holds only current documents and checkpoints.
    ///
    /// Sequences are preserved, so change-feed positions and checkpoints
    /// stay valid. Writers wait while compaction runs.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the replacement log could not be written.
    /// The live log is untouched in that case.
    pub fn compact(&self) -> CoreResult<CompactionStats> {
        let state = self.state.write();
        let mut backend = self.log.lock();
        let bytes_before = backend.size()?;

        let mut bytes = log::file_header().to_vec();
        for (sequence, id) in &state.by_sequence {
            if let Some(stored) = state.documents.get(id) {
                bytes.extend(log::encode_frame(&LogEntry::Document {
                    sequence: *sequence,
                    document: stored.replicated.clone(),
                })?);
            }
        }
        let mut checkpoints: Vec<_> = state.checkpoints.iter().collect();
        checkpoints.sort();
        for (name, sequence) in checkpoints {
            bytes.extend(log::encode_frame(&LogEntry::Checkpoint {
                name: name.clone(),
                sequence: *sequence,
            })?);
        }

        match &self.dir {
            Some(dir) => {
                let mut replacement = FileBackend::create_new(&dir.compact_path())?;
                replacement.append(&bytes)?;
                replacement.sync()?;
                dir.install_compacted_log()?;
                *backend = Box::new(replacement);
            }
            None => {
                backend.truncate(0)?;
                backend.append(&bytes)?;
                backend.flush()?;
            }
        }

        let stats = CompactionStats {
            bytes_before,
            bytes_after: bytes.len() as u64,
            documents: state.documents.len(),
        };
        info!(
            before = stats.bytes_before,
            after = stats.bytes_after,
            documents = stats.documents,
            "compacted document log"
        );
        Ok(stats)
    }

    /// Registers a check run against every document write.
    ///
    /// The store keeps only a weak reference. The check stops applying once
    /// its owner drops it.
    pub fn add_write_check(&self, check: Weak<dyn WriteCheck>) {
        let mut checks = self.write_checks.lock();
        checks.retain(|existing| existing.strong_count() > 0);
        checks.push(check);
    }

    fn run_write_checks(&self, state: &StoreState, candidate: &Document) -> CoreResult<()> {
        let checks: Vec<Arc<dyn WriteCheck>> = self
            .write_checks
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for check in checks {
            let mut current = state
                .documents
                .values()
                .map(|stored| &stored.replicated.document);
            check.check(candidate, &mut current)?;
        }
        Ok(())
    }

    /// Appends one entry, rolling the log back if it cannot be made durable.
    fn append(&self, entry: &LogEntry) -> CoreResult<()> {
        let frame = log::encode_frame(entry)?;
        let mut backend = self.log.lock();
        let offset = backend.size()?;

        let result = backend.append(&frame).and_then(|_| {
            if self.config.sync_on_write {
                backend.sync()
            } else {
                backend.flush()
            }
        });

        if let Err(err) = result {
            if let Err(rollback) = backend.truncate(offset) {
                warn!(error = %rollback, offset, "failed to roll back partial log write");
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn next_after(&self, after: Option<&DocumentId>) -> Option<Document> {
        let state = self.state.read();
        let next = match after {
            Some(after) => state
                .documents
                .range((Bound::Excluded(after), Bound::Unbounded))
                .next(),
            None => state.documents.iter().next(),
        };
        next.map(|(_, stored)| stored.replicated.document.clone())
    }
}

fn validate_body(body: &Body) -> CoreResult<()> {
    for key in body.keys() {
        if key.is_empty() {
            return Err(CoreError::invalid_document("field names must not be empty"));
        }
        if key == ID_FIELD || key == REV_FIELD {
            return Err(CoreError::invalid_document(format!(
                "field name {key} is reserved"
            )));
        }
    }
    Ok(())
}

/// Lazy iterator returned by [`LocalStore::all`].
pub struct AllDocuments<'a> {
    store: &'a LocalStore,
    after: Option<DocumentId>,
    finished: bool,
}

impl Iterator for AllDocuments<'_> {
    type Item = Document;

    fn next(&mut self) -> Option<Document> {
        if self.finished {
            return None;
        }
        match self.store.next_after(self.after.as_ref()) {
            Some(document) => {
                self.after = Some(document.id.clone());
                Some(document)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}
