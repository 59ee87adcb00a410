//! Database access used by the engine.
//!
//! The engine talks to PostgreSQL only through the [`Database`] trait, so
//! the scheduler and caches can run against any implementation.
//! [`PgDatabase`] is the production one: a `deadpool-postgres` pool with a
//! per-statement timeout.

use crate::config::EngineConfig;
use crate::error::{LiveError, Result};
use crate::row::Row;
use crate::sql;
use async_trait::async_trait;
use bytes::BytesMut;
use serde_json::Value;
use std::error::Error;
use std::future::Future;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

/// One row of a refresh result. `data` is `None` when the database elided it
/// because the caller already holds a row with the same hash.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub hash: String,
    pub data: Option<Row>,
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Run one or more statements without results (DDL, LISTEN).
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Run `query` with `values` and return every result row with its
    /// content hash, in result order.
    async fn refresh(&self, query: &str, values: &[Value], known_hashes: &[String]) -> Result<Vec<RawRow>>;

    /// Tables `query` reads.
    async fn resolve_dependencies(&self, query: &str, values: &[Value]) -> Result<Vec<String>>;

    /// Release pooled connections.
    async fn close(&self) {}
}

/// A JSON value bound as a query parameter. The wire encoding follows the
/// type PostgreSQL inferred for the placeholder.
#[derive(Debug, Clone)]
pub struct SqlValue(pub Value);

type BoxError = Box<dyn Error + Sync + Send>;

fn as_int(value: &Value) -> std::result::Result<i64, BoxError> {
    value
        .as_i64()
        .ok_or_else(|| format!("{value} is not an integer").into())
}

fn as_float(value: &Value) -> std::result::Result<f64, BoxError> {
    value
        .as_f64()
        .ok_or_else(|| format!("{value} is not a number").into())
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        let value = &self.0;
        if value.is_null() {
            return Ok(IsNull::Yes);
        }
        if *ty == Type::JSON || *ty == Type::JSONB {
            return value.to_sql(ty, out);
        }
        if *ty == Type::BOOL {
            return match value {
                Value::Bool(b) => b.to_sql(ty, out),
                other => Err(format!("{other} is not a boolean").into()),
            };
        }
        if *ty == Type::INT2 {
            return i16::try_from(as_int(value)?)?.to_sql(ty, out);
        }
        if *ty == Type::INT4 {
            return i32::try_from(as_int(value)?)?.to_sql(ty, out);
        }
        if *ty == Type::INT8 {
            return as_int(value)?.to_sql(ty, out);
        }
        if *ty == Type::FLOAT4 {
            return (as_float(value)? as f32).to_sql(ty, out);
        }
        if *ty == Type::FLOAT8 {
            return as_float(value)?.to_sql(ty, out);
        }
        if <&str as ToSql>::accepts(ty) {
            return match value {
                Value::String(s) => s.as_str().to_sql(ty, out),
                other => other.to_string().as_str().to_sql(ty, out),
            };
        }
        Err(format!("cannot bind {value} as {ty}").into())
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Collect the `Relation Name` entries of an `EXPLAIN (FORMAT JSON)` plan,
/// without duplicates, in first-seen order.
pub fn relations_in_plan(plan: &Value) -> Vec<String> {
    fn walk(node: &Value, out: &mut Vec<String>) {
        match node {
            Value::Array(items) => items.iter().for_each(|item| walk(item, out)),
            Value::Object(map) => {
                if let Some(Value::String(name)) = map.get("Relation Name") {
                    let qualified = match map.get("Schema") {
                        Some(Value::String(schema)) => format!("{schema}.{name}"),
                        _ => name.clone(),
                    };
                    if !out.contains(&qualified) {
                        out.push(qualified);
                    }
                }
                for key in ["Plan", "Plans"] {
                    if let Some(child) = map.get(key) {
                        walk(child, out);
                    }
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    walk(plan, &mut out);
    out
}

/// PostgreSQL via a `deadpool-postgres` pool.
pub struct PgDatabase {
    pool: deadpool_postgres::Pool,
    query_timeout: Duration,
}

impl PgDatabase {
    /// Parses the connection string and builds the pool. Connectivity is
    /// not checked until the first statement runs.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let pg_config: tokio_postgres::Config = config
            .connection_string
            .parse()
            .map_err(|e| LiveError::Config(format!("invalid connection string: {e}")))?;

        let mgr_config = deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        };
        let mgr =
            deadpool_postgres::Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);

        let pool = deadpool_postgres::Pool::builder(mgr)
            .max_size(config.max_pool_size)
            .build()
            .map_err(|e| LiveError::Connection(format!("pool creation failed: {e}")))?;

        Ok(PgDatabase {
            pool,
            query_timeout: config.query_timeout(),
        })
    }

    async fn timed<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| LiveError::Query(format!("{what} timed out after {:?}", self.query_timeout)))?
    }
}

fn bind_values(values: &[Value]) -> Vec<SqlValue> {
    values.iter().cloned().map(SqlValue).collect()
}

#[async_trait]
impl Database for PgDatabase {
    async fn execute(&self, sql: &str) -> Result<()> {
        self.timed("statement", async {
            let client = self.pool.get().await?;
            client.batch_execute(sql).await?;
            Ok(())
        })
        .await
    }

    async fn refresh(&self, query: &str, values: &[Value], known_hashes: &[String]) -> Result<Vec<RawRow>> {
        let text = sql::refresh_query(query, values.len() + 1);
        let bound = bind_values(values);
        let hashes: Vec<String> = known_hashes.to_vec();

        self.timed("refresh", async {
            let client = self.pool.get().await?;
            let mut params: Vec<&(dyn ToSql + Sync)> =
                bound.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            params.push(&hashes);

            let rows = client.query(text.as_str(), &params).await?;
            rows.iter()
                .map(|row| {
                    let hash: String = row.try_get("_hash")?;
                    let data: Option<Value> = row.try_get("_data")?;
                    let data = match data {
                        None => None,
                        Some(Value::Object(map)) => Some(map),
                        Some(other) => {
                            return Err(LiveError::Query(format!("row is not an object: {other}")))
                        }
                    };
                    Ok(RawRow { hash, data })
                })
                .collect()
        })
        .await
    }

    async fn resolve_dependencies(&self, query: &str, values: &[Value]) -> Result<Vec<String>> {
        let text = sql::explain_query(query);
        let bound = bind_values(values);

        self.timed("explain", async {
            let client = self.pool.get().await?;
            let params: Vec<&(dyn ToSql + Sync)> =
                bound.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            let row = client.query_one(text.as_str(), &params).await?;
            let plan: Value = row.try_get(0)?;
            Ok(relations_in_plan(&plan))
        })
        .await
    }

    async fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relations_in_nested_plan() {
        let plan = json!([{
            "Plan": {
                "Node Type": "Hash Join",
                "Plans": [
                    {"Node Type": "Seq Scan", "Relation Name": "orders", "Alias": "o"},
                    {"Node Type": "Hash", "Plans": [
                        {"Node Type": "Seq Scan", "Relation Name": "users", "Alias": "u"}
                    ]},
                    {"Node Type": "Seq Scan", "Relation Name": "orders", "Alias": "o2"}
                ]
            }
        }]);
        assert_eq!(relations_in_plan(&plan), vec!["orders", "users"]);
    }

    #[test]
    fn test_relations_with_schema() {
        let plan = json!([{"Plan": {"Relation Name": "events", "Schema": "audit"}}]);
        assert_eq!(relations_in_plan(&plan), vec!["audit.events"]);
        assert!(relations_in_plan(&json!([{"Plan": {"Node Type": "Result"}}])).is_empty());
    }

    #[test]
    fn test_sql_value_encoding() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            SqlValue(Value::Null).to_sql(&Type::INT4, &mut buf),
            Ok(IsNull::Yes)
        ));

        buf.clear();
        SqlValue(json!(7)).to_sql(&Type::INT4, &mut buf).unwrap();
        assert_eq!(&buf[..], &7i32.to_be_bytes());

        buf.clear();
        SqlValue(json!("abc")).to_sql(&Type::TEXT, &mut buf).unwrap();
        assert_eq!(&buf[..], b"abc");

        buf.clear();
        SqlValue(json!(true)).to_sql(&Type::BOOL, &mut buf).unwrap();
        assert_eq!(&buf[..], &[1]);
    }

    #[test]
    fn test_sql_value_rejects_mismatch() {
        let mut buf = BytesMut::new();
        assert!(SqlValue(json!("x")).to_sql(&Type::INT8, &mut buf).is_err());
        assert!(SqlValue(json!(70000)).to_sql(&Type::INT2, &mut buf).is_err());
        assert!(SqlValue(json!([1])).to_sql(&Type::BOOL, &mut buf).is_err());
    }

    #[test]
    fn test_pool_rejects_bad_connection_string() {
        let mut config = EngineConfig::new("host=localhost port=notaport", "chan");
        config.max_pool_size = 2;
        assert!(matches!(PgDatabase::new(&config), Err(LiveError::Config(_))));
    }
}
