//! Subscriptions: a consumer's view of one query cache.
//!
//! A [`Subscription`] owns the receiving end of its event stream and the
//! trigger rules that decide which change notices are relevant to it. The
//! [`SubscriptionHandle`] is the clonable control half; it can stop or
//! invalidate the subscription from another task.

use crate::changeset::RowDiff;
use crate::condition::Condition;
use crate::engine::EngineShared;
use crate::error::{LiveError, Result};
use crate::notice::ChangeNotice;
use crate::row::Row;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;

/// Which table changes are relevant, optionally narrowed by a condition.
#[derive(Debug, Clone)]
pub struct TriggerRule {
    pub table: String,
    pub database: Option<String>,
    pub condition: Option<Condition>,
}

impl TriggerRule {
    /// Every change on `table` is relevant.
    pub fn table(table: impl Into<String>) -> Self {
        TriggerRule {
            table: table.into(),
            database: None,
            condition: None,
        }
    }

    pub fn in_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Narrow the rule with a closure receiving `(row, after, deleted)`.
    pub fn when<F>(self, f: F) -> Self
    where
        F: Fn(&Row, Option<&Row>, bool) -> bool + Send + Sync + 'static,
    {
        self.with_condition(Condition::func(f))
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(LiveError::InvalidArgument(
                "trigger rule needs a table name".into(),
            ));
        }
        if self.database.as_deref().is_some_and(|d| d.trim().is_empty()) {
            return Err(LiveError::InvalidArgument(format!(
                "trigger rule for {} has an empty database name",
                self.table
            )));
        }
        Ok(())
    }

    /// Table (bare or schema-qualified) and database match the notice.
    pub fn applies_to(&self, notice: &ChangeNotice) -> bool {
        let table_matches = self.table == notice.table || self.table == notice.qualified_table();
        let database_matches = match (&self.database, &notice.database) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        };
        table_matches && database_matches
    }

    /// Applies to the notice and, when a condition is set, at least one of
    /// the notice's rows satisfies it.
    pub fn matches(&self, notice: &ChangeNotice) -> bool {
        if !self.applies_to(notice) {
            return false;
        }
        match &self.condition {
            None => true,
            Some(condition) => notice.rows.iter().any(|change| condition.matches(change)),
        }
    }
}

/// True iff some rule matches the notice.
pub fn match_row_event(rules: &[TriggerRule], notice: &ChangeNotice) -> bool {
    rules.iter().any(|rule| rule.matches(notice))
}

/// Delivered to a subscription, in emission order.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// The result set changed. `rows` is the full snapshot after `diff`.
    Update { diff: RowDiff, rows: Arc<Vec<Row>> },
    /// Refreshing the cache failed; the subscription stays attached.
    Error(LiveError),
}

/// Control half of a subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
    pub(crate) signature: Arc<str>,
    pub(crate) rules: Arc<Vec<TriggerRule>>,
    pub(crate) active: Arc<AtomicBool>,
    pub(crate) engine: Weak<EngineShared>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Signature of the query cache backing this subscription. Equal
    /// signatures mean a shared cache.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Detach from the engine. Returns false if already detached.
    pub fn stop(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.detach(self.id, &self.signature);
        }
        true
    }

    /// Force the backing cache to refresh on the next tick.
    pub fn invalidate(&self) {
        if !self.active() {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.invalidate(&self.signature);
        }
    }

    pub fn match_row_event(&self, notice: &ChangeNotice) -> bool {
        match_row_event(&self.rules, notice)
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("signature", &self.signature)
            .field("active", &self.active())
            .finish()
    }
}

/// A live query result. Dropping it detaches from the engine.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    events: UnboundedReceiver<SubscriptionEvent>,
}

impl Subscription {
    pub(crate) fn new(handle: SubscriptionHandle, events: UnboundedReceiver<SubscriptionEvent>) -> Self {
        Subscription { handle, events }
    }

    /// Next event. `None` once the subscription is stopped or the engine
    /// has shut down and every queued event was delivered.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn stop(&self) -> bool {
        self.handle.stop()
    }

    pub fn active(&self) -> bool {
        self.handle.active()
    }

    pub fn invalidate(&self) {
        self.handle.invalidate()
    }

    pub fn match_row_event(&self, notice: &ChangeNotice) -> bool {
        self.handle.match_row_event(notice)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.stop();
    }
}
