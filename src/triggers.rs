//! Trigger Registrar: per-table trigger bookkeeping.
//!
//! Each watched table maps to the set of cache signatures that depend on it.
//! The registrar only decides which DDL to run; the engine executes the
//! statements in order on a pooled connection.

use crate::sql;
use std::collections::{BTreeMap, HashSet};

/// DDL for one table, kept with the table name for error reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDdl {
    pub table: String,
    pub statements: Vec<String>,
}

#[derive(Debug)]
pub struct TriggerRegistrar {
    channel: String,
    function: String,
    bindings: BTreeMap<String, HashSet<String>>,
}

impl TriggerRegistrar {
    pub fn new(channel: impl Into<String>, function: impl Into<String>) -> Self {
        TriggerRegistrar {
            channel: channel.into(),
            function: function.into(),
            bindings: BTreeMap::new(),
        }
    }

    /// Record that `signature` depends on `table`. Returns the DDL that
    /// installs the trigger when the table was not watched yet.
    pub fn bind(&mut self, table: &str, signature: &str) -> Option<TriggerDdl> {
        let dependents = self.bindings.entry(table.to_string()).or_default();
        let first = dependents.is_empty();
        dependents.insert(signature.to_string());
        if !first {
            return None;
        }

        let trigger = sql::trigger_name(&self.channel, table);
        Some(TriggerDdl {
            table: table.to_string(),
            statements: vec![
                sql::drop_trigger(&trigger, table),
                sql::create_trigger(&trigger, table, &self.function),
            ],
        })
    }

    /// Remove `signature` from every table in `tables`. Returns DDL dropping
    /// the triggers whose dependent set became empty.
    pub fn unbind<'a, I>(&mut self, tables: I, signature: &str) -> Vec<TriggerDdl>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut ddl = Vec::new();
        for table in tables {
            let Some(dependents) = self.bindings.get_mut(table) else {
                continue;
            };
            dependents.remove(signature);
            if dependents.is_empty() {
                self.bindings.remove(table);
                let trigger = sql::trigger_name(&self.channel, table);
                ddl.push(TriggerDdl {
                    table: table.clone(),
                    statements: vec![sql::drop_trigger(&trigger, table)],
                });
            }
        }
        ddl
    }

    /// Drop every trigger and the shared function.
    pub fn teardown(&mut self) -> Vec<TriggerDdl> {
        let mut ddl: Vec<TriggerDdl> = std::mem::take(&mut self.bindings)
            .into_keys()
            .map(|table| {
                let trigger = sql::trigger_name(&self.channel, &table);
                TriggerDdl {
                    statements: vec![sql::drop_trigger(&trigger, &table)],
                    table,
                }
            })
            .collect();
        ddl.push(TriggerDdl {
            table: String::new(),
            statements: vec![sql::drop_function(&self.function)],
        });
        ddl
    }

    /// True if a trigger is (or is about to be) installed on the table.
    /// Accepts either the bare or the schema-qualified name.
    #[cfg(test)]
    pub fn is_bound(&self, table: &str, qualified: &str) -> bool {
        self.bindings.contains_key(table) || self.bindings.contains_key(qualified)
    }

    #[cfg(test)]
    pub fn dependents(&self, table: &str) -> usize {
        self.bindings.get(table).map_or(0, HashSet::len)
    }

    pub fn tables(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registrar() -> TriggerRegistrar {
        TriggerRegistrar::new("chan", "livepg_chan")
    }

    #[test]
    fn test_first_binding_installs_trigger() {
        let mut reg = registrar();
        let ddl = reg.bind("users", "q1").unwrap();
        assert_eq!(ddl.table, "users");
        assert_eq!(ddl.statements.len(), 2);
        assert!(ddl.statements[0].starts_with("DROP TRIGGER IF EXISTS \"chan_users\""));
        assert!(ddl.statements[1].starts_with("CREATE TRIGGER \"chan_users\""));
        assert_eq!(reg.dependents("users"), 1);
    }

    #[test]
    fn test_shared_table_installs_once() {
        let mut reg = registrar();
        assert!(reg.bind("users", "q1").is_some());
        assert!(reg.bind("users", "q2").is_none());
        assert!(reg.bind("users", "q2").is_none());
        assert_eq!(reg.dependents("users"), 2);
    }

    #[test]
    fn test_last_unbind_drops_trigger() {
        let mut reg = registrar();
        reg.bind("users", "q1");
        reg.bind("users", "q2");
        reg.bind("orders", "q2");

        let tables = vec!["users".to_string(), "orders".to_string()];
        let dropped = reg.unbind(&tables, "q2");
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].table, "orders");
        assert!(reg.is_bound("users", "public.users"));
        assert!(!reg.is_bound("orders", "public.orders"));

        let dropped = reg.unbind(&tables, "q1");
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].table, "users");
        assert!(reg.tables().is_empty());
    }

    #[test]
    fn test_rebind_after_drop_reinstalls() {
        let mut reg = registrar();
        reg.bind("users", "q1");
        reg.unbind(&["users".to_string()], "q1");
        assert!(reg.bind("users", "q1").is_some());
    }

    #[test]
    fn test_teardown() {
        let mut reg = registrar();
        reg.bind("users", "q1");
        reg.bind("public.orders", "q1");
        let ddl = reg.teardown();
        assert_eq!(ddl.len(), 3);
        assert!(ddl[2].statements[0].starts_with("DROP FUNCTION IF EXISTS \"livepg_chan\""));
        assert!(reg.tables().is_empty());
    }

    #[test]
    fn test_qualified_lookup() {
        let mut reg = registrar();
        reg.bind("public.users", "q1");
        assert!(reg.is_bound("users", "public.users"));
        assert!(!reg.is_bound("users", "other.users"));
    }
}
