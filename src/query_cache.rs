//! Query caches.
//!
//! One cache exists per signature (query text, bound values, key selector).
//! It holds the ordered rows of the last applied edit script and fans every
//! update out to the subscriptions sharing it.
//!
//! Lifecycle: `Uninitialized -> Pending -> Refreshing -> Idle`, back to
//! `Pending` whenever a relevant notice arrives or a subscriber invalidates.
//! A notice that arrives mid-refresh marks the cache pending again so the
//! change is picked up by the next tick.

use crate::changeset::RowDiff;
use crate::database::Database;
use crate::diff;
use crate::error::{LiveError, Result};
use crate::key_selector::KeySelector;
use crate::notice::ChangeNotice;
use crate::row::{plain_rows, HashedRow, Row};
use crate::subscription::{match_row_event, SubscriptionEvent, TriggerRule};
use log::{debug, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Canonical cache identity. `serde_json::Map` orders keys, so equal inputs
/// give equal text.
pub fn signature(query: &str, values: &[Value], key: &KeySelector) -> String {
    json!({
        "query": query,
        "values": values,
        "key": key.tag(),
    })
    .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Uninitialized,
    Pending,
    Refreshing,
    Idle,
}

struct Subscriber {
    id: u64,
    rules: Arc<Vec<TriggerRule>>,
    active: Arc<AtomicBool>,
    sender: UnboundedSender<SubscriptionEvent>,
}

struct CacheState {
    status: CacheStatus,
    rows: Arc<Vec<HashedRow>>,
    initialized: bool,
    update_count: u64,
    last_refresh: Option<Instant>,
    /// Tables this cache is bound to in the trigger registrar. `None` until
    /// the first tick resolves them.
    tables: Option<Vec<String>>,
    subscribers: Vec<Subscriber>,
}

pub struct QueryCache {
    signature: Arc<str>,
    query: String,
    values: Vec<Value>,
    key: KeySelector,
    min_interval: Option<Duration>,
    evicted: AtomicBool,
    state: Mutex<CacheState>,
}

impl QueryCache {
    pub fn new(
        query: &str,
        values: Vec<Value>,
        key: KeySelector,
        min_interval: Option<Duration>,
    ) -> Self {
        QueryCache {
            signature: signature(query, &values, &key).into(),
            query: query.to_string(),
            values,
            key,
            min_interval,
            evicted: AtomicBool::new(false),
            state: Mutex::new(CacheState {
                status: CacheStatus::Uninitialized,
                rows: Arc::new(Vec::new()),
                initialized: false,
                update_count: 0,
                last_refresh: None,
                tables: None,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn signature(&self) -> &Arc<str> {
        &self.signature
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn status(&self) -> CacheStatus {
        self.lock().status
    }

    pub fn update_count(&self) -> u64 {
        self.lock().update_count
    }

    pub fn rows(&self) -> Arc<Vec<HashedRow>> {
        self.lock().rows.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_pending(&self) -> bool {
        self.lock().status == CacheStatus::Pending
    }

    /// Move to `Pending`. Returns false if the cache already was pending,
    /// so repeated invalidation before a tick collapses into one refresh.
    pub fn mark_pending(&self) -> bool {
        if self.is_evicted() {
            return false;
        }
        let mut state = self.lock();
        if state.status == CacheStatus::Pending {
            return false;
        }
        state.status = CacheStatus::Pending;
        true
    }

    /// Time left before the minimum refresh interval allows another
    /// refresh; `None` when a refresh may run now.
    pub fn due_in(&self, now: Instant) -> Option<Duration> {
        let interval = self.min_interval?;
        let last = self.lock().last_refresh?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < interval).then(|| interval - elapsed)
    }

    /// Whether any subscriber's trigger rules match the notice. Conditions
    /// run with the cache unlocked.
    pub fn matches(&self, notice: &ChangeNotice) -> bool {
        let rules: Vec<Arc<Vec<TriggerRule>>> = self
            .lock()
            .subscribers
            .iter()
            .map(|s| s.rules.clone())
            .collect();
        rules.iter().any(|rules| match_row_event(rules, notice))
    }

    /// Tables named by the subscribers' trigger rules.
    pub fn rule_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        for subscriber in &self.lock().subscribers {
            for rule in subscriber.rules.iter() {
                if !tables.contains(&rule.table) {
                    tables.push(rule.table.clone());
                }
            }
        }
        tables
    }

    pub fn tables(&self) -> Option<Vec<String>> {
        self.lock().tables.clone()
    }

    pub fn set_tables(&self, tables: Vec<String>) {
        self.lock().tables = Some(tables);
    }

    /// Add tables to an already bound cache. Returns the ones that were new.
    pub fn extend_tables(&self, extra: &[String]) -> Vec<String> {
        let mut state = self.lock();
        let Some(tables) = state.tables.as_mut() else {
            return Vec::new();
        };
        let added = uncovered_tables(tables, extra);
        tables.extend(added.iter().cloned());
        added
    }

    /// Register a subscriber. An initialised cache immediately sends it the
    /// current rows as one `added` batch and returns false; otherwise the
    /// caller must schedule a refresh and true is returned.
    pub fn add_subscriber(
        &self,
        id: u64,
        rules: Arc<Vec<TriggerRule>>,
        active: Arc<AtomicBool>,
        sender: UnboundedSender<SubscriptionEvent>,
    ) -> bool {
        let mut state = self.lock();
        let needs_refresh = !state.initialized;
        if state.initialized {
            let event = SubscriptionEvent::Update {
                diff: RowDiff::snapshot(&state.rows),
                rows: Arc::new(plain_rows(&state.rows)),
            };
            let _ = sender.send(event);
        }
        state.subscribers.push(Subscriber {
            id,
            rules,
            active,
            sender,
        });
        needs_refresh
    }

    /// Remove a subscriber. Returns the remaining count, or `None` if the id
    /// was not subscribed.
    pub fn remove_subscriber(&self, id: u64) -> Option<usize> {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        (state.subscribers.len() != before).then_some(state.subscribers.len())
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Take the cache out of service. Remaining subscribers are deactivated
    /// and their event streams closed. Returns the tables it was bound to.
    pub fn evict(&self) -> Option<Vec<String>> {
        self.evicted.store(true, Ordering::SeqCst);
        let mut state = self.lock();
        for subscriber in state.subscribers.drain(..) {
            subscriber.active.store(false, Ordering::SeqCst);
        }
        state.tables.take()
    }

    pub fn broadcast_error(&self, err: &LiveError) {
        for subscriber in &self.lock().subscribers {
            let _ = subscriber.sender.send(SubscriptionEvent::Error(err.clone()));
        }
    }

    /// Run the refresh protocol: load the current result with hashes, diff
    /// it against the stored rows, apply the script and broadcast it.
    /// Failures are sent to the subscribers and returned.
    pub async fn refresh(&self, db: &dyn Database) -> Result<()> {
        let old = {
            let mut state = self.lock();
            state.status = CacheStatus::Refreshing;
            state.last_refresh = Some(Instant::now());
            state.rows.clone()
        };

        let result = self.load_and_apply(db, &old).await;
        if let Err(e) = &result {
            warn!("refresh of {} failed: {e}", self.signature);
            self.broadcast_error(e);
        }

        let mut state = self.lock();
        if state.status == CacheStatus::Refreshing {
            state.status = CacheStatus::Idle;
        }
        result
    }

    async fn load_and_apply(&self, db: &dyn Database, old: &Arc<Vec<HashedRow>>) -> Result<()> {
        let mut known: Vec<String> = old.iter().map(|r| r.hash.clone()).collect();
        known.sort();
        known.dedup();

        let raw = db.refresh(&self.query, &self.values, &known).await?;

        let by_hash: HashMap<&str, &Row> = old.iter().map(|r| (r.hash.as_str(), &r.data)).collect();
        let mut fresh = Vec::with_capacity(raw.len());
        for row in raw {
            let data = match row.data {
                Some(data) => data,
                None => by_hash
                    .get(row.hash.as_str())
                    .map(|data| (*data).clone())
                    .ok_or_else(|| {
                        LiveError::Query(format!("refresh elided unknown row {}", row.hash))
                    })?,
            };
            let key = self.key.key_for(&data);
            fresh.push(HashedRow::with_hash(row.hash, key, data));
        }

        let script = diff::generate(&diff::fingerprints(old), &fresh);

        let mut state = self.lock();
        if self.is_evicted() {
            debug!("discarding refresh of evicted cache {}", self.signature);
            return Ok(());
        }

        match script {
            Some(script) => {
                let rows = Arc::new(diff::apply(old, &script)?);
                let event_rows = Arc::new(plain_rows(&rows));
                let row_diff = script.to_row_diff(old);
                state.rows = rows;
                state.update_count += 1;
                for subscriber in &state.subscribers {
                    let _ = subscriber.sender.send(SubscriptionEvent::Update {
                        diff: row_diff.clone(),
                        rows: event_rows.clone(),
                    });
                }
                debug!(
                    "cache {} updated ({} operations, {} rows)",
                    self.signature,
                    script.len(),
                    state.rows.len()
                );
            }
            None if !state.initialized => {
                let rows = Arc::new(plain_rows(&state.rows));
                for subscriber in &state.subscribers {
                    let _ = subscriber.sender.send(SubscriptionEvent::Update {
                        diff: RowDiff::default(),
                        rows: rows.clone(),
                    });
                }
            }
            None => {}
        }
        state.initialized = true;
        Ok(())
    }
}

fn bare_name(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

/// Entries of `extra` not already covered by `tables`, comparing bare
/// table names so `users` and `public.users` count once.
pub fn uncovered_tables(tables: &[String], extra: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for table in extra {
        let bare = bare_name(table);
        let covered = tables
            .iter()
            .chain(out.iter())
            .any(|t| bare_name(t) == bare);
        if !covered {
            out.push(table.clone());
        }
    }
    out
}
