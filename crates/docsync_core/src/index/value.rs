//! Index key values.

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// A scalar JSON value usable as (part of) an index key.
///
/// Ordering is `Null < Bool < Number < String`, then by value within a
/// kind. Numbers compare numerically, so `1` and `1.0` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexValue {
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(Number),
    /// JSON string.
    String(String),
}

impl IndexValue {
    /// Converts a JSON value, or returns `None` for arrays and objects.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(|f| Self::Number(Number::new(f))),
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{}", n.0),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// A finite JSON number with a total order.
#[derive(Debug, Clone, Copy)]
pub struct Number(f64);

impl Number {
    fn new(value: f64) -> Self {
        // -0.0 and 0.0 are one key.
        Self(if value == 0.0 { 0.0 } else { value })
    }

    /// Returns the numeric value.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        self.0
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Number {}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::hash::Hash for Number {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// Renders a compound key for error messages.
pub(crate) fn render_key(key: &[IndexValue]) -> String {
    let parts: Vec<String> = key.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_convert() {
        assert_eq!(IndexValue::from_json(&json!(null)), Some(IndexValue::Null));
        assert_eq!(
            IndexValue::from_json(&json!("Ada")),
            Some(IndexValue::String("Ada".into()))
        );
        assert!(IndexValue::from_json(&json!([1])).is_none());
        assert!(IndexValue::from_json(&json!({"a": 1})).is_none());
    }

    #[test]
    fn numbers_compare_numerically() {
        let one = IndexValue::from_json(&json!(1)).unwrap();
        let one_float = IndexValue::from_json(&json!(1.0)).unwrap();
        let two = IndexValue::from_json(&json!(2)).unwrap();
        let neg_zero = IndexValue::from_json(&json!(-0.0)).unwrap();
        let zero = IndexValue::from_json(&json!(0)).unwrap();

        assert_eq!(one, one_float);
        assert!(one < two);
        assert_eq!(neg_zero, zero);
    }

    #[test]
    fn kinds_are_ordered() {
        let mut values = vec![
            IndexValue::String("a".into()),
            IndexValue::Bool(true),
            IndexValue::from_json(&json!(3)).unwrap(),
            IndexValue::Null,
        ];
        values.sort();
        assert_eq!(values[0], IndexValue::Null);
        assert_eq!(values[3], IndexValue::String("a".into()));
    }

    #[test]
    fn keys_render_readably() {
        let key = vec![IndexValue::String("ada".into()), IndexValue::Bool(false)];
        assert_eq!(render_key(&key), "[\"ada\", false]");
    }
}
