//! Key selectors map a row to its identity key.
//!
//! The selector is part of a query cache's signature, so every variant has a
//! stable textual tag. Closures have no identity of their own; custom
//! selectors carry a caller-chosen name that plays that role.

use crate::error::{LiveError, Result};
use crate::row::{Row, RowKey};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

type KeyFn = dyn Fn(&Row) -> Value + Send + Sync;

#[derive(Clone)]
pub enum KeySelector {
    /// Key is the value of one column.
    Column(String),
    /// Key is the tuple of several column values.
    Columns(Vec<String>),
    /// Key computed by a function of the row contents. Must be
    /// deterministic: equal rows have to yield equal keys.
    Custom { name: String, func: Arc<KeyFn> },
}

impl KeySelector {
    pub fn column(name: impl Into<String>) -> Self {
        KeySelector::Column(name.into())
    }

    pub fn columns<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeySelector::Columns(names.into_iter().map(Into::into).collect())
    }

    pub fn custom<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Row) -> Value + Send + Sync + 'static,
    {
        KeySelector::Custom {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            KeySelector::Column(name) if name.is_empty() => Err(LiveError::InvalidArgument(
                "key selector column name is empty".into(),
            )),
            KeySelector::Columns(names) if names.is_empty() => Err(LiveError::InvalidArgument(
                "key selector needs at least one column".into(),
            )),
            KeySelector::Columns(names) if names.iter().any(|n| n.is_empty()) => Err(
                LiveError::InvalidArgument("key selector column name is empty".into()),
            ),
            KeySelector::Custom { name, .. } if name.is_empty() => Err(
                LiveError::InvalidArgument("custom key selector needs a name".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Identity of the selector inside a cache signature.
    pub fn tag(&self) -> String {
        match self {
            KeySelector::Column(name) => format!("column:{name}"),
            KeySelector::Columns(names) => format!("columns:{}", Value::from(names.clone())),
            KeySelector::Custom { name, .. } => format!("custom:{name}"),
        }
    }

    pub fn key_for(&self, row: &Row) -> RowKey {
        match self {
            KeySelector::Column(name) => {
                RowKey::from_value(row.get(name).unwrap_or(&Value::Null))
            }
            KeySelector::Columns(names) => {
                let parts: Vec<Value> = names
                    .iter()
                    .map(|n| row.get(n).cloned().unwrap_or(Value::Null))
                    .collect();
                RowKey::from_value(&Value::Array(parts))
            }
            KeySelector::Custom { func, .. } => RowKey::from_value(&func(row)),
        }
    }
}

impl fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::row_from_value;
    use serde_json::json;

    #[test]
    fn test_column_key() {
        let row = row_from_value(json!({"id": 5, "name": "x"}));
        assert_eq!(KeySelector::column("id").key_for(&row).as_str(), "5");
        assert_eq!(KeySelector::column("missing").key_for(&row).as_str(), "null");
    }

    #[test]
    fn test_columns_key() {
        let row = row_from_value(json!({"a": 1, "b": "z"}));
        let key = KeySelector::columns(["a", "b"]).key_for(&row);
        assert_eq!(key.as_str(), r#"[1,"z"]"#);
    }

    #[test]
    fn test_custom_key() {
        let selector = KeySelector::custom("lower_name", |row: &Row| {
            json!(row.get("name").and_then(Value::as_str).map(str::to_lowercase))
        });
        let row = row_from_value(json!({"name": "ABC"}));
        assert_eq!(selector.key_for(&row).as_str(), "\"abc\"");
        assert_eq!(selector.tag(), "custom:lower_name");
    }

    #[test]
    fn test_tags_distinguish_selectors() {
        assert_ne!(KeySelector::column("id").tag(), KeySelector::columns(["id"]).tag());
        assert_eq!(KeySelector::column("id").tag(), KeySelector::column("id").tag());
    }

    #[test]
    fn test_validate() {
        assert!(KeySelector::column("").validate().is_err());
        assert!(KeySelector::Columns(vec![]).validate().is_err());
        assert!(KeySelector::custom("", |_: &Row| Value::Null).validate().is_err());
        assert!(KeySelector::column("id").validate().is_ok());
    }
}
