/// Row types shared by the cache, the diff engine and subscribers.
///
/// A row is a JSON object as produced by `row_to_json`. The engine pairs each
/// stored row with a content hash (equal content, equal hash) and an identity
/// key produced by the subscription's key selector.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A result row, column name to JSON value.
pub type Row = Map<String, Value>;

/// Stable identity of a row across refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(key: impl Into<String>) -> Self {
        RowKey(key.into())
    }

    /// Key from the JSON encoding of a value, so `"7"` and `7` differ.
    pub fn from_value(value: &Value) -> Self {
        RowKey(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A row together with its content hash and identity key.
#[derive(Debug, Clone, PartialEq)]
pub struct HashedRow {
    pub hash: String,
    pub key: RowKey,
    pub data: Row,
}

impl HashedRow {
    /// Hash `data` locally. Rows loaded from PostgreSQL carry the hash the
    /// refresh query computed instead.
    pub fn new(data: Row, key: RowKey) -> Self {
        HashedRow {
            hash: content_hash(&data),
            key,
            data,
        }
    }

    pub fn with_hash(hash: impl Into<String>, key: RowKey, data: Row) -> Self {
        HashedRow {
            hash: hash.into(),
            key,
            data,
        }
    }
}

/// Deterministic content hash of a row.
///
/// `serde_json::Map` keeps keys sorted, so the serialized form is canonical.
pub fn content_hash(row: &Row) -> String {
    let canonical = Value::Object(row.clone()).to_string();
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Strip hashes and keys, keeping row order.
pub fn plain_rows(rows: &[HashedRow]) -> Vec<Row> {
    rows.iter().map(|r| r.data.clone()).collect()
}

/// Build a row from a `json!` object literal. Non-objects yield an empty row.
pub fn row_from_value(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
