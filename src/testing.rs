//! In-memory database double for engine tests.

use crate::config::EngineConfig;
use crate::database::{Database, RawRow};
use crate::error::{LiveError, Result};
use crate::reassembler::split_payload;
use crate::row::{content_hash, row_from_value, Row};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Small parts so multi-part reassembly runs in every engine test.
const TEST_CHUNK_CHARS: usize = 16;

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::new("host=localhost dbname=test", "test");
    config.stagnant_timeout_ms = 5;
    config
}

#[derive(Debug, Default, Clone)]
pub struct Tables(HashMap<String, Vec<Row>>);

impl Tables {
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.0.get(table).cloned().unwrap_or_default()
    }
}

type QueryFn = Box<dyn Fn(&Tables, &[Value]) -> Vec<Row> + Send + Sync>;

struct Definition {
    tables: Vec<String>,
    run: QueryFn,
}

#[derive(Default)]
pub struct MockDatabase {
    tables: Mutex<Tables>,
    queries: Mutex<HashMap<String, Definition>>,
    refreshes: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    statements: Mutex<Vec<String>>,
    next_msg: AtomicU64,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define<F>(&self, query: &str, tables: &[&str], run: F)
    where
        F: Fn(&Tables, &[Value]) -> Vec<Row> + Send + Sync + 'static,
    {
        self.queries.lock().unwrap().insert(
            query.to_string(),
            Definition {
                tables: tables.iter().map(|t| t.to_string()).collect(),
                run: Box::new(run),
            },
        );
    }

    pub fn fail(&self, query: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(query.to_string());
        } else {
            set.remove(query);
        }
    }

    pub fn refresh_count(&self, query: &str) -> usize {
        self.refreshes.lock().unwrap().get(query).copied().unwrap_or(0)
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    /// Notice parts the trigger would publish for one row change.
    fn publish(&self, payload: Value) -> Vec<String> {
        let id = self.next_msg.fetch_add(1, Ordering::Relaxed);
        split_payload(&format!("msg{id}"), &payload.to_string(), TEST_CHUNK_CHARS)
    }

    pub fn insert(&self, table: &str, row: Value) -> Vec<String> {
        let row = row_from_value(row);
        self.tables
            .lock()
            .unwrap()
            .0
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        self.publish(json!({"table": table, "schema": "public", "op": "INSERT", "data": [row]}))
    }

    /// Merge `patch` into the row whose `id` equals `id`.
    pub fn update(&self, table: &str, id: Value, patch: Value) -> Vec<String> {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.0.entry(table.to_string()).or_default();
        let Some(row) = rows.iter_mut().find(|r| r.get("id") == Some(&id)) else {
            return Vec::new();
        };
        let before = row.clone();
        for (column, value) in row_from_value(patch) {
            row.insert(column, value);
        }
        let after = row.clone();
        drop(tables);
        self.publish(json!({
            "table": table, "schema": "public", "op": "UPDATE",
            "old_data": [before], "new_data": [after]
        }))
    }

    pub fn delete(&self, table: &str, id: Value) -> Vec<String> {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.0.entry(table.to_string()).or_default();
        let Some(pos) = rows.iter().position(|r| r.get("id") == Some(&id)) else {
            return Vec::new();
        };
        let row = rows.remove(pos);
        drop(tables);
        self.publish(json!({"table": table, "schema": "public", "op": "DELETE", "data": [row]}))
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn execute(&self, sql: &str) -> Result<()> {
        self.statements.lock().unwrap().push(sql.to_string());
        Ok(())
    }

    async fn refresh(&self, query: &str, values: &[Value], known_hashes: &[String]) -> Result<Vec<RawRow>> {
        *self.refreshes.lock().unwrap().entry(query.to_string()).or_default() += 1;
        if self.failing.lock().unwrap().contains(query) {
            return Err(LiveError::Query(format!("relation for {query} does not exist")));
        }

        let queries = self.queries.lock().unwrap();
        let definition = queries
            .get(query)
            .ok_or_else(|| LiveError::Query(format!("unknown query {query}")))?;
        let tables = self.tables.lock().unwrap().clone();
        Ok((definition.run)(&tables, values)
            .into_iter()
            .map(|row| {
                let hash = content_hash(&row);
                let data = (!known_hashes.contains(&hash)).then_some(row);
                RawRow { hash, data }
            })
            .collect())
    }

    async fn resolve_dependencies(&self, query: &str, _values: &[Value]) -> Result<Vec<String>> {
        self.queries
            .lock()
            .unwrap()
            .get(query)
            .map(|d| d.tables.clone())
            .ok_or_else(|| LiveError::Query(format!("unknown query {query}")))
    }
}
