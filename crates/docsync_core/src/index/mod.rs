//! Secondary indexes over document fields.
//!
//! Indexes are derived from the store and never authoritative. They are
//! declared by name, rebuilt as a whole from a store snapshot, and queried
//! with a [`Filter`] of per-field predicates.
//!
//! # Index contents
//!
//! - `_id` and `_rev` resolve to the document id and revision
//! - a document enters an index only if every indexed field holds a
//!   scalar (string, number, bool or null)
//! - multi-field indexes use compound keys in field order

mod definition;
mod field;
mod filter;
mod manager;
mod value;

pub use definition::{IndexDefinition, DEFAULT_INDEX};
pub use field::{extract_key, FieldIndex, IndexKey};
pub use filter::{Filter, Predicate};
pub use manager::{BuildReport, IndexManager, IndexStats};
pub use value::{IndexValue, Number};
