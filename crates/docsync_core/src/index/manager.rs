//! Index manager: declared indexes, builds and queries.

use crate::document::{Document, DocumentId, ID_FIELD};
use crate::error::{CoreResult, IndexError};
use crate::index::definition::IndexDefinition;
use crate::index::field::{extract_key, FieldIndex, IndexKey};
use crate::index::filter::{Filter, Predicate};
use crate::index::value::{render_key, IndexValue};
use crate::store::{LocalStore, Sequence, WriteCheck};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Usage counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexStats {
    /// Builds that produced a new index state.
    pub builds: u64,
    /// Builds skipped because nothing changed.
    pub skipped_builds: u64,
    /// Builds that failed and left the previous state in place.
    pub failed_builds: u64,
    /// Queries narrowed through an index.
    pub lookups: u64,
    /// Queries answered by scanning the built documents.
    pub scans: u64,
}

/// What [`IndexManager::update_all_indexes`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildReport {
    /// Store sequence the indexes now reflect.
    pub sequence: Sequence,
    /// Documents in the build.
    pub documents: usize,
    /// False if the previous build was already current.
    pub rebuilt: bool,
}

#[derive(Debug, Default)]
struct Definitions {
    by_name: BTreeMap<String, IndexDefinition>,
    /// Bumped on every new declaration.
    generation: u64,
}

/// Declared unique indexes, enforced on every store write.
#[derive(Debug, Default)]
struct UniqueConstraints {
    definitions: RwLock<Vec<IndexDefinition>>,
}

impl WriteCheck for UniqueConstraints {
    fn check(
        &self,
        candidate: &Document,
        current: &mut dyn Iterator<Item = &Document>,
    ) -> CoreResult<()> {
        let definitions = self.definitions.read();
        let keys: Vec<(&IndexDefinition, IndexKey)> = definitions
            .iter()
            .filter_map(|definition| {
                extract_key(definition, candidate).map(|key| (definition, key))
            })
            .collect();
        if keys.is_empty() {
            return Ok(());
        }

        for document in current.filter(|document| document.id != candidate.id) {
            for (definition, key) in &keys {
                if extract_key(definition, document).as_ref() == Some(key) {
                    return Err(IndexError::UniqueViolation {
                        index: definition.name.clone(),
                        key: render_key(key),
                        first: document.id.to_string(),
                        second: candidate.id.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// One complete, immutable index build.
#[derive(Debug)]
struct IndexBuild {
    sequence: Sequence,
    generation: u64,
    documents: BTreeMap<DocumentId, Document>,
    indexes: Vec<FieldIndex>,
}

impl IndexBuild {
    fn index_on(&self, field: &str) -> Option<&FieldIndex> {
        self.indexes
            .iter()
            .find(|index| index.definition().single_field() == Some(field))
    }

    /// Narrows candidates through single-field indexes. `None` means no
    /// index applied and every document is a candidate.
    fn candidates(&self, filter: &Filter) -> Option<BTreeSet<DocumentId>> {
        let mut candidates: Option<BTreeSet<DocumentId>> = None;

        for (field, predicate) in filter.predicates() {
            let Predicate::Equals(expected) = predicate else {
                continue;
            };
            let (Some(index), Some(value)) = (self.index_on(field), IndexValue::from_json(expected))
            else {
                continue;
            };

            let hits = index.lookup(&[value]).cloned().unwrap_or_default();
            candidates = Some(match candidates {
                Some(current) => current.intersection(&hits).cloned().collect(),
                None => hits,
            });
        }
        candidates
    }
}

/// Maintains secondary indexes over a [`LocalStore`].
///
/// Indexes are derived state. They are recomputed by
/// [`update_all_indexes`](Self::update_all_indexes), which callers run
/// after the writes they want queries to see, and are never updated
/// write-by-write.
///
/// # Guarantees
///
/// - A build reads one consistent store snapshot.
/// - A build is published only if every index built; a failed build
///   leaves the previous one in place.
/// - Queries read the last published build, never the live store.
/// - A write that would duplicate the key of a unique index is refused by
///   the store itself, for local saves and replicated revisions alike.
///   Documents already stored when the index is declared are not
///   re-checked; a duplicate among them fails the next build.
///
/// # Example
///
/// ```rust
/// use docsync_core::{body_from_value, DocumentId, Filter, IndexManager, LocalStore, StoreConfig};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let store = Arc::new(LocalStore::in_memory(StoreConfig::default()).unwrap());
/// let indexes = IndexManager::new(Arc::clone(&store));
/// indexes.ensure_indexed(["name"], "by_name").unwrap();
///
/// let id = DocumentId::new("ada").unwrap();
/// store.put(&id, body_from_value(json!({"name": "Ada"})).unwrap()).unwrap();
/// indexes.update_all_indexes().unwrap();
///
/// let hits = indexes.query(&Filter::new().equals("name", "Ada")).unwrap();
/// assert_eq!(hits[0].id, id);
/// ```
#[derive(Debug)]
pub struct IndexManager {
    store: Arc<LocalStore>,
    definitions: RwLock<Definitions>,
    unique: Arc<UniqueConstraints>,
    /// Serializes builds so an older snapshot never replaces a newer one.
    build_lock: Mutex<()>,
    current: RwLock<Option<Arc<IndexBuild>>>,
    stats: RwLock<IndexStats>,
}

impl IndexManager {
    /// Creates a manager with no indexes over `store`.
    #[must_use]
    pub fn new(store: Arc<LocalStore>) -> Self {
        let unique = Arc::new(UniqueConstraints::default());
        let check: Arc<dyn WriteCheck> = unique.clone();
        store.add_write_check(Arc::downgrade(&check));

        Self {
            store,
            definitions: RwLock::new(Definitions::default()),
            unique,
            build_lock: Mutex::new(()),
            current: RwLock::new(None),
            stats: RwLock::new(IndexStats::default()),
        }
    }

    /// Declares a non-unique index named `name` over `fields`.
    ///
    /// Declaring the same name with the same fields again is a no-op.
    ///
    /// # Errors
    ///
    /// See [`IndexManager::ensure_index`].
    pub fn ensure_indexed<I, S>(&self, fields: I, name: &str) -> CoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_index(IndexDefinition::new(name, fields))
    }

    /// Declares an index.
    ///
    /// The index takes part in the next build; until then queries keep
    /// using the previous build.
    ///
    /// # Errors
    ///
    /// - [`IndexError::InvalidDefinition`] for an empty name or field list
    /// - [`IndexError::DefinitionConflict`] if the name is taken by a
    ///   different definition
    pub fn ensure_index(&self, definition: IndexDefinition) -> CoreResult<()> {
        definition.validate()?;

        let mut definitions = self.definitions.write();
        if let Some(existing) = definitions.by_name.get(&definition.name) {
            if *existing == definition {
                return Ok(());
            }
            return Err(IndexError::DefinitionConflict {
                name: definition.name,
            }
            .into());
        }

        debug!(name = %definition.name, fields = ?definition.fields, unique = definition.unique, "declared index");
        // Ids are unique by construction.
        if definition.unique && definition.single_field() != Some(ID_FIELD) {
            self.unique.definitions.write().push(definition.clone());
        }
        definitions
            .by_name
            .insert(definition.name.clone(), definition);
        definitions.generation += 1;
        Ok(())
    }

    /// Returns the declared indexes in name order.
    #[must_use]
    pub fn definitions(&self) -> Vec<IndexDefinition> {
        self.definitions.read().by_name.values().cloned().collect()
    }

    /// Recomputes every declared index from the store's current contents.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::UniqueViolation`] if a unique index would hold
    /// a duplicate key. The previous build stays in place.
    pub fn update_all_indexes(&self) -> CoreResult<BuildReport> {
        let _build = self.build_lock.lock();

        let (definitions, generation) = {
            let definitions = self.definitions.read();
            let list: Vec<IndexDefinition> = definitions.by_name.values().cloned().collect();
            (list, definitions.generation)
        };

        if let Some(current) = self.current.read().as_ref() {
            if current.generation == generation && current.sequence == self.store.last_sequence()
            {
                self.stats.write().skipped_builds += 1;
                return Ok(BuildReport {
                    sequence: current.sequence,
                    documents: current.documents.len(),
                    rebuilt: false,
                });
            }
        }

        let snapshot = self.store.snapshot();
        let mut indexes = Vec::with_capacity(definitions.len());
        for definition in definitions {
            match FieldIndex::build(definition, &snapshot.documents) {
                Ok(index) => indexes.push(index),
                Err(err) => {
                    warn!(error = %err, sequence = snapshot.sequence, "index build failed, keeping previous build");
                    self.stats.write().failed_builds += 1;
                    return Err(err.into());
                }
            }
        }

        let documents: BTreeMap<DocumentId, Document> = snapshot
            .documents
            .into_iter()
            .map(|doc| (doc.id.clone(), doc))
            .collect();
        let report = BuildReport {
            sequence: snapshot.sequence,
            documents: documents.len(),
            rebuilt: true,
        };

        *self.current.write() = Some(Arc::new(IndexBuild {
            sequence: snapshot.sequence,
            generation,
            documents,
            indexes,
        }));
        self.stats.write().builds += 1;

        info!(
            sequence = report.sequence,
            documents = report.documents,
            "rebuilt indexes"
        );
        Ok(report)
    }

    /// Returns the documents matching `filter`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::NotBuilt`] if no build has completed yet.
    pub fn query(&self, filter: &Filter) -> CoreResult<Vec<Document>> {
        let build = self.current.read().clone().ok_or(IndexError::NotBuilt)?;

        let results: Vec<Document> = match build.candidates(filter) {
            Some(ids) => {
                self.stats.write().lookups += 1;
                ids.iter()
                    .filter_map(|id| build.documents.get(id))
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            }
            None => {
                self.stats.write().scans += 1;
                build
                    .documents
                    .values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            }
        };
        Ok(results)
    }

    /// Returns true once a build has completed.
    #[must_use]
    pub fn is_built(&self) -> bool {
        self.current.read().is_some()
    }

    /// Returns the store sequence of the current build.
    #[must_use]
    pub fn built_sequence(&self) -> Option<Sequence> {
        self.current.read().as_ref().map(|build| build.sequence)
    }

    /// Returns a copy of the usage counters.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        self.stats.read().clone()
    }
}
