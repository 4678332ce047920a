//! Query key definitions.
//!
//! A [`QueryKey`] is an ordered list of JSON values. Keys are canonicalized
//! into a stable string for hashing and exact equality, and compared
//! positionally for partial (prefix) matching.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured identifier for one cached unit of data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    pub fn new(parts: Vec<Value>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append one element, returning the extended key.
    pub fn push(mut self, part: impl Into<Value>) -> Self {
        self.0.push(part.into());
        self
    }

    /// Canonical serialization of this key.
    pub fn hash_key(&self) -> String {
        serialize(self)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serialize(self))
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self(parts)
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        Self(vec![Value::from(part)])
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(parts: [&str; N]) -> Self {
        Self(parts.into_iter().map(Value::from).collect())
    }
}

/// Build a [`QueryKey`] from JSON-like elements.
///
/// ```ignore
/// let key = query_key!["todos", { "page": 2 }];
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::cache::QueryKey::default()
    };
    ($($part:tt),+ $(,)?) => {
        $crate::cache::QueryKey::new(vec![$($crate::__private::serde_json::json!($part)),+])
    };
}

/// Serialize a key into its canonical string form.
///
/// Object properties are sorted recursively so that key order never affects
/// the result; array order is preserved.
pub fn serialize(key: &QueryKey) -> String {
    let canonical = Value::Array(key.0.iter().map(canonicalize).collect());
    canonical.to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::new();
            for (name, inner) in entries {
                sorted.insert(name.clone(), canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compare a requested key against a candidate key.
///
/// With `exact`, the canonical serializations must match. Otherwise every
/// element of `requested` must deep-equal the candidate's element at the same
/// position; trailing candidate elements are ignored, but a requested key
/// longer than the candidate never matches.
pub fn compare(requested: &QueryKey, candidate: &QueryKey, exact: bool) -> bool {
    if exact {
        return serialize(requested) == serialize(candidate);
    }

    if requested.len() > candidate.len() {
        return false;
    }

    requested
        .parts()
        .iter()
        .zip(candidate.parts())
        .all(|(wanted, actual)| wanted == actual)
}
