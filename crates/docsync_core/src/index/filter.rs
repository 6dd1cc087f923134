//! Query filters.

use crate::document::Document;
use crate::error::IndexError;
use crate::index::value::IndexValue;
use serde_json::Value;
use std::collections::BTreeMap;

const CONTAINS_OPERATOR: &str = "$contains";
const EQ_OPERATOR: &str = "$eq";

/// A condition on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// The field equals the value. Numbers compare numerically.
    Equals(Value),
    /// The field is a string containing the text (case-sensitive).
    Contains(String),
}

impl Predicate {
    /// Evaluates the predicate against a field value (`None` if absent).
    #[must_use]
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        match self {
            Predicate::Equals(expected) => {
                match (IndexValue::from_json(expected), IndexValue::from_json(actual)) {
                    (Some(expected), Some(actual)) => expected == actual,
                    _ => expected == actual,
                }
            }
            Predicate::Contains(text) => actual.as_str().is_some_and(|s| s.contains(text.as_str())),
        }
    }
}

/// A conjunction of field predicates. The empty filter matches everything.
///
/// ```rust
/// use docsync_core::Filter;
/// use serde_json::json;
///
/// let filter = Filter::from_json(&json!({
///     "kind": "person",
///     "name": {"$contains": "Ad"}
/// }))
/// .unwrap();
/// assert_eq!(filter.len(), 2);
///
/// let same = Filter::new().equals("kind", "person").contains("name", "Ad");
/// assert_eq!(filter, same);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: BTreeMap<String, Predicate>,
}

impl Filter {
    /// Creates the empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality predicate.
    #[must_use]
    pub fn equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates
            .insert(field.into(), Predicate::Equals(value.into()));
        self
    }

    /// Adds a substring predicate.
    #[must_use]
    pub fn contains(mut self, field: impl Into<String>, text: impl Into<String>) -> Self {
        self.predicates
            .insert(field.into(), Predicate::Contains(text.into()));
        self
    }

    /// Parses a JSON filter.
    ///
    /// Each key is a field name. A plain value means equality; an object
    /// with a single `$contains` (string) or `$eq` key selects that
    /// operator. Objects without `$` keys are compared for equality.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidFilter`] if `value` is not an object, a
    /// field name is empty, or an operator is unknown or malformed.
    pub fn from_json(value: &Value) -> Result<Self, IndexError> {
        let Value::Object(fields) = value else {
            return Err(IndexError::InvalidFilter(format!(
                "filter must be a JSON object, got {value}"
            )));
        };

        let mut filter = Self::new();
        for (field, condition) in fields {
            if field.is_empty() {
                return Err(IndexError::InvalidFilter(
                    "field names must not be empty".into(),
                ));
            }
            let predicate = parse_condition(field, condition)?;
            filter.predicates.insert(field.clone(), predicate);
        }
        Ok(filter)
    }

    /// Returns true if the filter has no predicates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Returns the number of predicates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    /// Iterates over `(field, predicate)` pairs in field order.
    pub fn predicates(&self) -> impl Iterator<Item = (&str, &Predicate)> {
        self.predicates.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns true if `document` satisfies every predicate.
    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        self.predicates
            .iter()
            .all(|(field, predicate)| predicate.matches(document.field(field).as_deref()))
    }
}

fn parse_condition(field: &str, condition: &Value) -> Result<Predicate, IndexError> {
    let Value::Object(object) = condition else {
        return Ok(Predicate::Equals(condition.clone()));
    };
    if !object.keys().any(|k| k.starts_with('$')) {
        return Ok(Predicate::Equals(condition.clone()));
    }

    let mut entries = object.iter();
    let (Some((operator, operand)), None) = (entries.next(), entries.next()) else {
        return Err(IndexError::InvalidFilter(format!(
            "condition on '{field}' must hold exactly one operator"
        )));
    };

    match operator.as_str() {
        CONTAINS_OPERATOR => match operand {
            Value::String(text) => Ok(Predicate::Contains(text.clone())),
            other => Err(IndexError::InvalidFilter(format!(
                "{CONTAINS_OPERATOR} on '{field}' needs a string, got {other}"
            ))),
        },
        EQ_OPERATOR => Ok(Predicate::Equals(operand.clone())),
        other => Err(IndexError::InvalidFilter(format!(
            "unsupported operator {other} on '{field}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{body_from_value, DocumentId};
    use crate::revision::Revision;
    use serde_json::json;

    fn doc(id: &str, body: Value) -> Document {
        let body = body_from_value(body).unwrap();
        Document {
            id: DocumentId::new(id).unwrap(),
            revision: Revision::next(None, &body),
            body,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = Filter::from_json(&json!({})).unwrap();
        assert!(filter.is_empty());
        assert!(filter.matches(&doc("a", json!({}))));
    }

    #[test]
    fn equality_and_contains() {
        let ada = doc("ada", json!({"name": "Ada Lovelace", "born": 1815}));
        let filter = Filter::from_json(&json!({
            "name": {"$contains": "Love"},
            "born": 1815.0
        }))
        .unwrap();
        assert!(filter.matches(&ada));

        assert!(!Filter::new().contains("name", "love").matches(&ada));
        assert!(!Filter::new().contains("born", "18").matches(&ada));
        assert!(!Filter::new().equals("missing", Value::Null).matches(&ada));
    }

    #[test]
    fn pseudo_fields_are_filterable() {
        let ada = doc("ada", json!({}));
        assert!(Filter::new().equals("_id", "ada").matches(&ada));
        assert!(!Filter::new().equals("_id", "bob").matches(&ada));
    }

    #[test]
    fn structured_values_compare_exactly() {
        let d = doc("a", json!({"tags": ["x", "y"], "address": {"city": "London"}}));
        assert!(Filter::from_json(&json!({"tags": ["x", "y"]}))
            .unwrap()
            .matches(&d));
        assert!(Filter::from_json(&json!({"address": {"city": "London"}}))
            .unwrap()
            .matches(&d));
        assert!(Filter::from_json(&json!({"address": {"$eq": {"city": "London"}}}))
            .unwrap()
            .matches(&d));
    }

    #[test]
    fn malformed_filters_are_rejected() {
        for bad in [
            json!([]),
            json!("name"),
            json!({"": 1}),
            json!({"name": {"$regex": "A.*"}}),
            json!({"name": {"$contains": 3}}),
            json!({"name": {"$contains": "a", "$eq": "b"}}),
        ] {
            assert!(
                matches!(Filter::from_json(&bad), Err(IndexError::InvalidFilter(_))),
                "accepted {bad}"
            );
        }
    }
}
