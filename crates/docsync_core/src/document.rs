//! Documents and their identifiers.

use crate::error::{CoreError, CoreResult};
use crate::revision::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

/// Document content: a JSON object with unique field names.
pub type Body = Map<String, Value>;

/// Body field that carries a caller-chosen id on save.
pub const ID_FIELD: &str = "_id";

/// Pseudo-field resolving to a document's current revision.
pub const REV_FIELD: &str = "_rev";

/// Stable identifier of a document.
///
/// Ids are non-empty strings. They are either chosen by the caller or
/// generated with [`DocumentId::generate`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    /// Creates an id from a caller-supplied string.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidDocument`] if the string is empty.
    pub fn new(id: impl Into<String>) -> CoreResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CoreError::invalid_document("document id must not be empty"));
        }
        Ok(Self(id))
    }

    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for DocumentId {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

/// The current revision of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier.
    pub id: DocumentId,
    /// Version token of this content.
    pub revision: Revision,
    /// Field values.
    pub body: Body,
}

impl Document {
    /// Resolves a field name against this document.
    ///
    /// `_id` and `_rev` resolve to the id and revision text; every other
    /// name is looked up in the body.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Cow<'_, Value>> {
        match name {
            ID_FIELD => Some(Cow::Owned(Value::String(self.id.to_string()))),
            REV_FIELD => Some(Cow::Owned(Value::String(self.revision.to_string()))),
            _ => self.body.get(name).map(Cow::Borrowed),
        }
    }

    /// Renders the document as one JSON object with `_id` and `_rev` set.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut object = Map::with_capacity(self.body.len() + 2);
        object.insert(ID_FIELD.into(), Value::String(self.id.to_string()));
        object.insert(REV_FIELD.into(), Value::String(self.revision.to_string()));
        for (key, value) in &self.body {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }
}

/// Splits a caller-supplied body into the id to save under and the body
/// to store.
///
/// A string `_id` field is taken as the id and removed from the body;
/// without one a fresh id is generated.
///
/// # Errors
///
/// Returns [`CoreError::InvalidDocument`] if `_id` is present but is not a
/// non-empty string.
pub fn split_id(mut body: Body) -> CoreResult<(DocumentId, Body)> {
    match body.remove(ID_FIELD) {
        None => Ok((DocumentId::generate(), body)),
        Some(Value::String(id)) => Ok((DocumentId::new(id)?, body)),
        Some(other) => Err(CoreError::invalid_document(format!(
            "{ID_FIELD} must be a string, got {other}"
        ))),
    }
}

/// Converts an arbitrary JSON value into a body.
///
/// # Errors
///
/// Returns [`CoreError::InvalidDocument`] unless `value` is an object.
pub fn body_from_value(value: Value) -> CoreResult<Body> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CoreError::invalid_document(format!(
            "document body must be a JSON object, got {other}"
        ))),
    }
}

/// A document together with the revisions it descends from.
///
/// This is the unit exchanged with a remote: the ancestors let the receiver
/// tell a fast-forward from a divergent edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedDocument {
    /// The current revision.
    pub document: Document,
    /// Ancestor revisions, most recent first.
    pub ancestors: Vec<Revision>,
}

impl ReplicatedDocument {
    /// Returns the document id.
    #[must_use]
    pub fn id(&self) -> &DocumentId {
        &self.document.id
    }

    /// Returns the current revision.
    #[must_use]
    pub fn revision(&self) -> &Revision {
        &self.document.revision
    }

    /// Returns true if `revision` is this document's revision or one of its
    /// ancestors.
    #[must_use]
    pub fn descends_from(&self, revision: &Revision) -> bool {
        self.revision() == revision || self.ancestors.contains(revision)
    }
}
