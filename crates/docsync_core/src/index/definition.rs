//! Index definitions.

use crate::error::IndexError;

/// Name of the index every store declares over `_id`.
pub const DEFAULT_INDEX: &str = "all";

/// A declared secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    /// Name the index is declared under.
    pub name: String,
    /// Indexed fields, in key order.
    pub fields: Vec<String>,
    /// Whether two documents may share a key.
    pub unique: bool,
}

impl IndexDefinition {
    /// Creates a non-unique index definition.
    pub fn new<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// The default index over document ids.
    #[must_use]
    pub fn default_index() -> Self {
        Self::new(DEFAULT_INDEX, [crate::document::ID_FIELD]).unique()
    }

    /// Makes this a unique index.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Checks the definition is usable.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidDefinition`] for an empty name, an empty
    /// field list, an empty field name or a repeated field.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.name.is_empty() {
            return Err(IndexError::InvalidDefinition(
                "index name must not be empty".into(),
            ));
        }
        if self.fields.is_empty() {
            return Err(IndexError::InvalidDefinition(format!(
                "index '{}' has no fields",
                self.name
            )));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.is_empty() {
                return Err(IndexError::InvalidDefinition(format!(
                    "index '{}' has an empty field name",
                    self.name
                )));
            }
            if self.fields[..i].contains(field) {
                return Err(IndexError::InvalidDefinition(format!(
                    "index '{}' repeats field '{field}'",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Returns the field if this index covers exactly one field.
    #[must_use]
    pub fn single_field(&self) -> Option<&str> {
        match self.fields.as_slice() {
            [field] => Some(field.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(IndexDefinition::new("by_name", ["name"]).validate().is_ok());
        assert!(IndexDefinition::new("", ["name"]).validate().is_err());
        assert!(IndexDefinition::new("x", Vec::<String>::new())
            .validate()
            .is_err());
        assert!(IndexDefinition::new("x", [""]).validate().is_err());
        assert!(IndexDefinition::new("x", ["a", "a"]).validate().is_err());
    }

    #[test]
    fn default_index_covers_id() {
        let def = IndexDefinition::default_index();
        assert_eq!(def.name, "all");
        assert_eq!(def.single_field(), Some("_id"));
        assert!(def.unique);
    }
}
