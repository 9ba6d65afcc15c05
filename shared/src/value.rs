//! The dynamically shaped state tree shared by host and clients
//!
//! Game state is an arbitrary tree of keyed maps, ordered arrays and
//! primitives. Modelling it as a closed enum lets the diff engine pattern
//! match on shape, and lets the wire codec carry it without a schema.
//! Typed game code converts at the edges through [`Value::from_serialize`]
//! and [`Value::deserialize_into`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Keyed children of a [`Value::Map`]
///
/// Ordered by key so that diffs and serialized snapshots are deterministic
/// across participants.
pub type Map = BTreeMap<String, Value>;

/// A node of the state tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Milliseconds since the Unix epoch. Copied by value like any primitive.
    Timestamp(u64),
    Array(Vec<Value>),
    Map(Map),
}

/// Shape of a [`Value`], ignoring its contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Timestamp,
    Array,
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Timestamp => "timestamp",
            ValueKind::Array => "array",
            ValueKind::Map => "map",
        };
        f.write_str(name)
    }
}

impl Value {
    /// Creates an empty map node
    pub fn map() -> Self {
        Value::Map(Map::new())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::Array(_) => ValueKind::Array,
            Value::Map(_) => ValueKind::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view of ints and floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut Map> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a key when this node is a map
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|entries| entries.get(key))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.as_map_mut().and_then(|entries| entries.get_mut(key))
    }

    /// Inserts into a map node, returning the previous value
    ///
    /// Returns `None` without inserting when this node is not a map.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.as_map_mut()
            .and_then(|entries| entries.insert(key.into(), value.into()))
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.as_map_mut().and_then(|entries| entries.remove(key))
    }

    /// Converts any serde-serializable type into a state tree
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Value::from)
    }

    /// Converts this tree into a typed value
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::from(self.clone()))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Map> for Value {
    fn from(entries: Map) -> Self {
        Value::Map(entries)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(n) => serde_json::Value::from(n),
            // Non-finite floats have no JSON form
            Value::Float(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Timestamp(ms) => serde_json::Value::from(ms),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::Value::from(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Score {
        player: String,
        points: i64,
        history: Vec<i64>,
    }

    #[test]
    fn test_map_helpers() {
        let mut value = Value::map();
        assert_eq!(value.insert("x", 10), None);
        assert_eq!(value.insert("x", 11), Some(Value::Int(10)));
        assert_eq!(value.get("x").and_then(Value::as_i64), Some(11));
        assert_eq!(value.remove("x"), Some(Value::Int(11)));
        assert!(value.get("x").is_none());
    }

    #[test]
    fn test_insert_into_non_map_is_ignored() {
        let mut value = Value::Int(3);
        assert_eq!(value.insert("x", 1), None);
        assert_eq!(value, Value::Int(3));
    }

    #[test]
    fn test_json_conversion() {
        let value = Value::from(json!({"a": 1, "b": [true, null, 2.5], "c": "hi"}));
        let a = value.get("a").cloned();
        assert_eq!(a, Some(Value::Int(1)));
        assert_eq!(
            value.get("b"),
            Some(&Value::Array(vec![
                Value::Bool(true),
                Value::Null,
                Value::Float(2.5)
            ]))
        );
        assert_eq!(value.get("c").and_then(Value::as_str), Some("hi"));

        let back = serde_json::Value::from(value);
        assert_eq!(back, json!({"a": 1, "b": [true, null, 2.5], "c": "hi"}));
    }

    #[test]
    fn test_typed_roundtrip() {
        let score = Score {
            player: "p1".to_string(),
            points: 42,
            history: vec![1, 2, 3],
        };
        let value = Value::from_serialize(&score).unwrap();
        assert_eq!(value.get("points"), Some(&Value::Int(42)));

        let back: Score = value.deserialize_into().unwrap();
        assert_eq!(back, score);
    }

    #[test]
    fn test_timestamp_becomes_number_in_json() {
        let json = serde_json::Value::from(Value::Timestamp(1_700_000_000_000));
        assert_eq!(json, json!(1_700_000_000_000u64));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(Value::map().kind().to_string(), "map");
        assert_eq!(Value::Float(1.0).kind(), ValueKind::Float);
        assert_ne!(Value::Float(1.0).kind(), Value::Int(1).kind());
    }
}
