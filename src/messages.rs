/// WebSocket message types for client-server communication
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::changeset::RowDiff;
use crate::condition::Condition;
use crate::error::Result;
use crate::key_selector::KeySelector;
use crate::row::Row;
use crate::subscription::TriggerRule;

/// Trigger rule as sent over the wire. Conditions are filter expressions.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RuleSpec {
    pub table: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
}

impl RuleSpec {
    pub fn to_rule(&self) -> Result<TriggerRule> {
        let mut rule = TriggerRule::table(self.table.clone());
        if let Some(database) = &self.database {
            rule = rule.in_database(database.clone());
        }
        if let Some(condition) = &self.condition {
            rule = rule.with_condition(Condition::parse(condition)?);
        }
        Ok(rule)
    }
}

/// Messages sent from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Start a live query under a client-chosen id
    Select {
        id: String,
        query: String,
        #[serde(default)]
        values: Vec<JsonValue>,
        key_columns: Vec<String>,
        triggers: Vec<RuleSpec>,
        #[serde(default)]
        min_interval_ms: Option<u64>,
    },

    /// Force a refresh of a live query
    Invalidate { id: String },

    /// Stop a live query
    Stop { id: String },
}

/// Key selector for a list of key columns.
pub fn key_for_columns(columns: &[String]) -> KeySelector {
    match columns {
        [single] => KeySelector::column(single.clone()),
        many => KeySelector::columns(many.iter().cloned()),
    }
}

/// Messages sent from server to client
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Live query accepted
    Selected { id: String },

    /// Result set changed
    Update {
        id: String,
        diff: RowDiff,
        rows: Vec<Row>,
    },

    /// Answer to Stop
    Stopped { id: String, stopped: bool },

    /// Error occurred
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
}
