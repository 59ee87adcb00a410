//! Change notices published by the row-level triggers.
//!
//! The trigger function sends one JSON document per affected row:
//!
//! ```json
//! {"table": "users", "schema": "public", "database": "app", "op": "INSERT", "data": [{"id": 1}]}
//! {"table": "users", "schema": "public", "op": "UPDATE",
//!  "new_data": [{"id": 1, "name": "b"}], "old_data": [{"id": 1, "name": "a"}]}
//! ```
//!
//! Batched payloads with several rows per array are accepted as well.

use crate::error::{LiveError, Result};
use crate::row::Row;
use serde::Deserialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeOperation {
    Insert,
    Update,
    Delete,
}

impl NoticeOperation {
    pub fn parse(op: &str) -> Option<Self> {
        match op.to_ascii_uppercase().as_str() {
            "INSERT" => Some(NoticeOperation::Insert),
            "UPDATE" => Some(NoticeOperation::Update),
            "DELETE" => Some(NoticeOperation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for NoticeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NoticeOperation::Insert => "INSERT",
            NoticeOperation::Update => "UPDATE",
            NoticeOperation::Delete => "DELETE",
        })
    }
}

/// One row affected by a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Insert(Row),
    Update { before: Row, after: Row },
    Delete(Row),
}

/// Decoded description of one row-level mutation batch on a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotice {
    pub table: String,
    pub schema: Option<String>,
    pub database: Option<String>,
    pub operation: NoticeOperation,
    pub rows: Vec<RowChange>,
}

#[derive(Deserialize)]
struct NoticePayload {
    table: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    database: Option<String>,
    #[serde(alias = "operation")]
    op: String,
    #[serde(default, alias = "rows")]
    data: Vec<Row>,
    #[serde(default, alias = "after")]
    new_data: Vec<Row>,
    #[serde(default, alias = "before")]
    old_data: Vec<Row>,
}

impl ChangeNotice {
    /// Decode a reassembled payload. Failures carry the raw payload so the
    /// engine can report it.
    pub fn from_json(payload: &str) -> Result<Self> {
        let invalid = |reason: String| LiveError::InvalidNotification {
            payload: payload.to_string(),
            reason,
        };

        let raw: NoticePayload = serde_json::from_str(payload).map_err(|e| invalid(e.to_string()))?;
        let operation = NoticeOperation::parse(&raw.op)
            .ok_or_else(|| invalid(format!("unknown operation '{}'", raw.op)))?;

        let rows = match operation {
            NoticeOperation::Insert => raw.data.into_iter().map(RowChange::Insert).collect(),
            NoticeOperation::Delete => raw.data.into_iter().map(RowChange::Delete).collect(),
            NoticeOperation::Update => {
                if raw.new_data.len() != raw.old_data.len() {
                    return Err(invalid(format!(
                        "update carries {} new rows but {} old rows",
                        raw.new_data.len(),
                        raw.old_data.len()
                    )));
                }
                raw.old_data
                    .into_iter()
                    .zip(raw.new_data)
                    .map(|(before, after)| RowChange::Update { before, after })
                    .collect()
            }
        };

        Ok(ChangeNotice {
            table: raw.table,
            schema: raw.schema,
            database: raw.database,
            operation,
            rows,
        })
    }

    /// `schema.table` when the schema is known, otherwise the bare table.
    pub fn qualified_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_notice() {
        let notice = ChangeNotice::from_json(
            r#"{"table":"users","schema":"public","database":"app","op":"INSERT","data":[{"id":1,"name":"a"}]}"#,
        )
        .unwrap();
        assert_eq!(notice.table, "users");
        assert_eq!(notice.database.as_deref(), Some("app"));
        assert_eq!(notice.operation, NoticeOperation::Insert);
        assert_eq!(notice.qualified_table(), "public.users");
        match &notice.rows[0] {
            RowChange::Insert(row) => assert_eq!(row["name"], json!("a")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_update_notice_pairs_rows() {
        let notice = ChangeNotice::from_json(
            r#"{"table":"users","op":"UPDATE","new_data":[{"id":1,"name":"b"}],"old_data":[{"id":1,"name":"a"}]}"#,
        )
        .unwrap();
        assert_eq!(notice.qualified_table(), "users");
        match &notice.rows[0] {
            RowChange::Update { before, after } => {
                assert_eq!(before["name"], json!("a"));
                assert_eq!(after["name"], json!("b"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_delete_notice_with_rows_alias() {
        let notice =
            ChangeNotice::from_json(r#"{"table":"t","operation":"delete","rows":[{"id":1},{"id":2}]}"#)
                .unwrap();
        assert_eq!(notice.operation, NoticeOperation::Delete);
        assert_eq!(notice.rows.len(), 2);
    }

    #[test]
    fn test_malformed_payload_reports_raw_text() {
        let err = ChangeNotice::from_json("{\"table\": ").unwrap_err();
        match err {
            LiveError::InvalidNotification { payload, .. } => assert_eq!(payload, "{\"table\": "),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_operation() {
        let err = ChangeNotice::from_json(r#"{"table":"t","op":"TRUNCATE"}"#).unwrap_err();
        assert!(matches!(err, LiveError::InvalidNotification { .. }));
    }

    #[test]
    fn test_unbalanced_update() {
        let err = ChangeNotice::from_json(r#"{"table":"t","op":"UPDATE","new_data":[{"id":1}]}"#)
            .unwrap_err();
        assert!(matches!(err, LiveError::InvalidNotification { .. }));
    }
}
