//! Ordered field index.

use crate::document::{Document, DocumentId};
use crate::error::IndexError;
use crate::index::definition::IndexDefinition;
use crate::index::value::{render_key, IndexValue};
use std::collections::{BTreeMap, BTreeSet};

/// Compound key: one value per indexed field.
pub type IndexKey = Vec<IndexValue>;

/// One built index: key to the ids of documents holding that key.
///
/// Keys and ids are kept in `BTree` collections so lookups return ids in
/// a stable order.
#[derive(Debug, Clone)]
pub struct FieldIndex {
    definition: IndexDefinition,
    entries: BTreeMap<IndexKey, BTreeSet<DocumentId>>,
}

impl FieldIndex {
    /// Builds the index over `documents`.
    ///
    /// Documents missing an indexed field, or holding a non-scalar value
    /// in one, are left out.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::UniqueViolation`] if the index is unique and
    /// two documents share a key.
    pub fn build<'a, I>(definition: IndexDefinition, documents: I) -> Result<Self, IndexError>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut entries: BTreeMap<IndexKey, BTreeSet<DocumentId>> = BTreeMap::new();

        for document in documents {
            let Some(key) = extract_key(&definition, document) else {
                continue;
            };
            if definition.unique {
                if let Some(first) = entries.get(&key).and_then(|ids| ids.iter().next()) {
                    return Err(IndexError::UniqueViolation {
                        index: definition.name.clone(),
                        key: render_key(&key),
                        first: first.to_string(),
                        second: document.id.to_string(),
                    });
                }
            }
            entries.entry(key).or_default().insert(document.id.clone());
        }

        Ok(Self {
            definition,
            entries,
        })
    }

    /// Returns the definition this index was built from.
    #[must_use]
    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// Returns the ids holding `key`.
    #[must_use]
    pub fn lookup(&self, key: &[IndexValue]) -> Option<&BTreeSet<DocumentId>> {
        self.entries.get(key)
    }

    /// Returns the number of distinct keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the number of indexed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    /// Returns true if no document is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Extracts the key of `document`, or `None` if it does not enter the index.
#[must_use]
pub fn extract_key(definition: &IndexDefinition, document: &Document) -> Option<IndexKey> {
    definition
        .fields
        .iter()
        .map(|field| {
            document
                .field(field)
                .and_then(|value| IndexValue::from_json(&value))
        })
        .collect()
}
