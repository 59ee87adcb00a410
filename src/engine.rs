//! The live query engine.
//!
//! `LivePg` owns the registries shared by notice handling and the update
//! loop: the query caches by signature, the trigger registrar, the pending
//! set and the queue of trigger drops waiting for the next tick. All of them
//! sit behind one mutex that is never held across an `.await`. When a cache
//! lock is also needed it is taken after the engine lock.

use crate::config::EngineConfig;
use crate::database::{Database, PgDatabase};
use crate::error::{LiveError, Result};
use crate::key_selector::KeySelector;
use crate::listener::NoticeListener;
use crate::notice::ChangeNotice;
use crate::query_cache::{signature, uncovered_tables, QueryCache};
use crate::reassembler::Reassembler;
use crate::scheduler;
use crate::sql;
use crate::subscription::{Subscription, SubscriptionHandle, TriggerRule};
use crate::triggers::{TriggerDdl, TriggerRegistrar};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

const ERROR_CHANNEL_CAPACITY: usize = 256;

pub(crate) struct EngineState {
    caches: HashMap<Arc<str>, Arc<QueryCache>>,
    registrar: TriggerRegistrar,
    /// Dependencies resolved per signature. Kept after eviction so a later
    /// identical select skips the plan query.
    dependencies: HashMap<Arc<str>, Vec<String>>,
    pending: HashSet<Arc<str>>,
    ddl_queue: Vec<TriggerDdl>,
    closed: bool,
}

impl EngineState {
    /// Bind `table` for `sig`. A trigger drop still queued for the table is
    /// superseded by the returned create, which runs before the next drain.
    fn bind_table(&mut self, table: &str, sig: &str) -> Option<TriggerDdl> {
        let ddl = self.registrar.bind(table, sig)?;
        self.ddl_queue.retain(|queued| queued.table != table);
        Some(ddl)
    }
}

/// State shared between the engine handle, its tasks and subscriptions.
pub struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) db: Arc<dyn Database>,
    state: Mutex<EngineState>,
    reassembler: Mutex<Reassembler>,
    errors: broadcast::Sender<LiveError>,
    next_id: AtomicU64,
    pub(crate) wake: Notify,
}

impl EngineShared {
    fn new(config: EngineConfig, db: Arc<dyn Database>) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        EngineShared {
            state: Mutex::new(EngineState {
                caches: HashMap::new(),
                registrar: TriggerRegistrar::new(config.channel.clone(), config.function_name()),
                dependencies: HashMap::new(),
                pending: HashSet::new(),
                ddl_queue: Vec::new(),
                closed: false,
            }),
            reassembler: Mutex::new(Reassembler::new(config.reassembly_timeout())),
            errors,
            next_id: AtomicU64::new(1),
            wake: Notify::new(),
            config,
            db,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit an operational error on the engine's error signal.
    pub(crate) fn report(&self, err: LiveError) {
        error!("{err}");
        let _ = self.errors.send(err);
    }

    fn subscribe(
        self: &Arc<Self>,
        query: &str,
        values: Vec<Value>,
        key: KeySelector,
        rules: Vec<TriggerRule>,
        min_interval: Option<Duration>,
    ) -> Result<Subscription> {
        let mut state = self.lock();
        if state.closed {
            return Err(LiveError::Closed);
        }

        let sig: Arc<str> = signature(query, &values, &key).into();
        let cache = state
            .caches
            .entry(sig.clone())
            .or_insert_with(|| {
                debug!("new query cache {sig}");
                Arc::new(QueryCache::new(query, values, key, min_interval))
            })
            .clone();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let rules = Arc::new(rules);

        let rule_tables: Vec<String> = rules.iter().map(|r| r.table.clone()).collect();
        let needs_refresh = cache.add_subscriber(id, rules.clone(), active.clone(), sender);

        let added = cache.extend_tables(&rule_tables);
        for table in &added {
            if let Some(ddl) = state.bind_table(table, &sig) {
                state.ddl_queue.push(ddl);
            }
        }

        if needs_refresh && cache.mark_pending() {
            state.pending.insert(sig.clone());
        }
        drop(state);

        if needs_refresh || !added.is_empty() {
            self.wake.notify_one();
        }

        let handle = SubscriptionHandle {
            id,
            signature: sig,
            rules,
            active,
            engine: Arc::downgrade(self),
        };
        Ok(Subscription::new(handle, events))
    }

    /// Remove a subscriber; the last one out evicts the cache and queues
    /// the trigger drops for tables nothing else depends on.
    pub(crate) fn detach(&self, id: u64, sig: &str) {
        let mut state = self.lock();
        let Some(cache) = state.caches.get(sig).cloned() else {
            return;
        };
        if cache.remove_subscriber(id) != Some(0) {
            return;
        }

        state.caches.remove(sig);
        state.pending.remove(sig);
        if let Some(tables) = cache.evict() {
            let drops = state.registrar.unbind(&tables, sig);
            if !drops.is_empty() {
                state.ddl_queue.extend(drops);
                self.wake.notify_one();
            }
        }
        debug!("evicted query cache {sig}");
    }

    pub(crate) fn invalidate(&self, sig: &str) {
        let mut state = self.lock();
        let Some(cache) = state.caches.get(sig).cloned() else {
            return;
        };
        if cache.mark_pending() {
            state.pending.insert(cache.signature().clone());
            self.wake.notify_one();
        }
    }

    /// Feed one raw notice part. Complete payloads are decoded and matched
    /// against every cache; failures go to the error signal.
    pub(crate) fn handle_notice(&self, raw: &str) {
        let payload = {
            let mut reassembler = self.reassembler.lock().unwrap_or_else(PoisonError::into_inner);
            reassembler.push(raw)
        };
        match payload {
            Ok(Some(payload)) => match ChangeNotice::from_json(&payload) {
                Ok(notice) => self.process_notice(&notice),
                Err(e) => self.report(e),
            },
            Ok(None) => {}
            Err(e) => self.report(e),
        }
    }

    pub(crate) fn process_notice(&self, notice: &ChangeNotice) {
        debug!(
            "{} on {} ({} rows)",
            notice.operation,
            notice.qualified_table(),
            notice.rows.len()
        );
        let check_queued = self.config.check_condition_when_queued;
        let caches: Vec<Arc<QueryCache>> = self.lock().caches.values().cloned().collect();

        // Conditions are caller code and may re-enter the engine.
        let matched: Vec<Arc<QueryCache>> = caches
            .into_iter()
            .filter(|cache| check_queued || !cache.is_pending())
            .filter(|cache| cache.matches(notice))
            .collect();
        if matched.is_empty() {
            return;
        }

        let mut state = self.lock();
        let mut queued = false;
        for cache in matched {
            if !cache.is_evicted() && cache.mark_pending() {
                state.pending.insert(cache.signature().clone());
                queued = true;
            }
        }
        drop(state);

        if queued {
            self.wake.notify_one();
        }
    }

    pub(crate) fn take_ddl(&self) -> Vec<TriggerDdl> {
        std::mem::take(&mut self.lock().ddl_queue)
    }

    /// Drain the pending set. Caches still inside their minimum interval go
    /// back into the set; the shortest remaining wait is returned with them.
    pub(crate) fn drain_pending(&self, now: Instant) -> (Vec<Arc<QueryCache>>, Option<Duration>) {
        let mut state = self.lock();
        let drained: Vec<Arc<str>> = state.pending.drain().collect();
        let mut due = Vec::new();
        let mut wait: Option<Duration> = None;

        for sig in drained {
            let Some(cache) = state.caches.get(&sig).cloned() else {
                continue;
            };
            match cache.due_in(now) {
                None => due.push(cache),
                Some(remaining) => {
                    wait = Some(wait.map_or(remaining, |w| w.min(remaining)));
                    state.pending.insert(sig);
                }
            }
        }
        (due, wait)
    }

    pub(crate) fn cached_dependencies(&self, sig: &str) -> Option<Vec<String>> {
        self.lock().dependencies.get(sig).cloned()
    }

    pub(crate) fn store_dependencies(&self, sig: &Arc<str>, tables: Vec<String>) {
        self.lock().dependencies.insert(sig.clone(), tables);
    }

    /// Bind the cache's tables in the registrar: the resolved dependencies
    /// plus any rule table they do not already cover. Returns the trigger
    /// DDL to run. An evicted cache binds nothing.
    pub(crate) fn bind_cache(&self, cache: &QueryCache, dependencies: &[String]) -> Vec<TriggerDdl> {
        let mut state = self.lock();
        if cache.is_evicted() || cache.tables().is_some() {
            return Vec::new();
        }

        let mut tables = uncovered_tables(&[], dependencies);
        let extra = uncovered_tables(&tables, &cache.rule_tables());
        tables.extend(extra);

        let sig = cache.signature();
        let ddl = tables
            .iter()
            .filter_map(|table| state.bind_table(table, sig))
            .collect();
        cache.set_tables(tables);
        ddl
    }

    /// Run trigger DDL in order. A failing statement abandons the rest of
    /// that table's statements and is reported.
    pub(crate) async fn run_ddl(&self, ddl: Vec<TriggerDdl>) {
        for item in ddl {
            for statement in &item.statements {
                if let Err(e) = self.db.execute(statement).await {
                    self.report(LiveError::Trigger {
                        table: item.table.clone(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
    }

    pub(crate) fn prune_reassembly(&self) {
        let stale = self
            .reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .prune_stale();
        for id in stale {
            self.report(LiveError::MalformedNotice(format!(
                "message {id} dropped before all parts arrived"
            )));
        }
    }

    /// Evict every cache and hand back the DDL that removes all triggers and
    /// the notice function. Later selects fail with `Closed`.
    fn close(&self) -> Vec<TriggerDdl> {
        let mut state = self.lock();
        state.closed = true;
        for cache in state.caches.values() {
            cache.evict();
        }
        state.caches.clear();
        state.pending.clear();
        let mut ddl = std::mem::take(&mut state.ddl_queue);
        ddl.extend(state.registrar.teardown());
        ddl
    }
}

/// A live query engine bound to one notification channel.
pub struct LivePg {
    shared: Arc<EngineShared>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listener: Mutex<Option<NoticeListener>>,
}

impl LivePg {
    /// Connect to PostgreSQL: build the pool, install the notice function,
    /// open the dedicated listen connection and start the update loop.
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let db: Arc<dyn Database> = Arc::new(PgDatabase::new(&config)?);
        let engine = Self::start(config, db).await?;

        let shared = engine.shared.clone();
        let listening =
            NoticeListener::connect(&shared.config.connection_string, &shared.config.channel);
        engine.listen(listening).await
    }

    /// Install the listen connection, or tear the engine down if it could
    /// not be opened.
    async fn listen<F>(self, listening: F) -> Result<Self>
    where
        F: Future<Output = Result<(NoticeListener, UnboundedReceiver<String>)>>,
    {
        match listening.await {
            Ok((listener, notices)) => {
                *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
                self.attach_notices(notices);
                Ok(self)
            }
            Err(e) => {
                error!("could not listen on channel {}: {e}", self.shared.config.channel);
                if let Err(cleanup) = self.end().await {
                    warn!("cleanup after failed listen: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Start an engine on an existing database handle. Notices are supplied
    /// through [`LivePg::handle_notice`] or [`LivePg::attach_notices`].
    pub async fn start(config: EngineConfig, db: Arc<dyn Database>) -> Result<Self> {
        config.validate()?;
        db.execute(&sql::create_function(
            &config.function_name(),
            &config.channel,
            config.notify_chunk_chars,
        ))
        .await?;
        info!("installed notice function {}", config.function_name());

        let shared = Arc::new(EngineShared::new(config, db));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler = tokio::spawn(scheduler::run(shared.clone(), shutdown_rx));

        Ok(LivePg {
            shared,
            shutdown,
            tasks: Mutex::new(vec![scheduler]),
            listener: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Subscribe to a live query.
    ///
    /// Argument problems fail here with `InvalidArgument`. Everything that
    /// goes wrong later arrives as a `SubscriptionEvent::Error` and on
    /// [`LivePg::errors`].
    pub fn select(
        &self,
        query: &str,
        values: Vec<Value>,
        key: KeySelector,
        triggers: Vec<TriggerRule>,
        min_interval: Option<Duration>,
    ) -> Result<Subscription> {
        if query.trim().is_empty() {
            return Err(LiveError::InvalidArgument("query must be a non-empty string".into()));
        }
        key.validate()?;
        if triggers.is_empty() {
            return Err(LiveError::InvalidArgument(
                "at least one trigger rule is required".into(),
            ));
        }
        for rule in &triggers {
            rule.validate()?;
        }
        self.shared.subscribe(query, values, key, triggers, min_interval)
    }

    /// Feed one raw notification payload (a notice part).
    pub fn handle_notice(&self, raw: &str) {
        self.shared.handle_notice(raw);
    }

    /// Pump notice parts from `notices` until it closes or the engine ends.
    pub fn attach_notices(&self, mut notices: UnboundedReceiver<String>) {
        let shared = self.shared.clone();
        let mut shutdown = self.shutdown.subscribe();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    raw = notices.recv() => match raw {
                        Some(raw) => shared.handle_notice(&raw),
                        None => {
                            warn!("notice stream closed");
                            shared.report(LiveError::Connection("notice stream closed".into()));
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(pump);
    }

    /// Engine error signal: connection loss, malformed notices, trigger and
    /// refresh failures.
    pub fn errors(&self) -> broadcast::Receiver<LiveError> {
        self.shared.errors.subscribe()
    }

    pub fn cache_count(&self) -> usize {
        self.shared.lock().caches.len()
    }

    /// Tables that currently carry a trigger.
    pub fn bound_tables(&self) -> Vec<String> {
        self.shared.lock().registrar.tables()
    }

    /// Stop every subscription, drop all installed triggers and the notice
    /// function. Returns the first DDL failure; every failure is also
    /// reported on the error signal.
    pub async fn cleanup(&self) -> Result<()> {
        let ddl = self.shared.close();
        let mut first_error = None;
        for item in ddl {
            for statement in &item.statements {
                if let Err(e) = self.shared.db.execute(statement).await {
                    let err = LiveError::Trigger {
                        table: item.table.clone(),
                        message: e.to_string(),
                    };
                    self.shared.report(err.clone());
                    first_error.get_or_insert(err);
                }
            }
        }
        info!("removed triggers and notice function for channel {}", self.shared.config.channel);
        first_error.map_or(Ok(()), Err)
    }

    /// Stop the update loop and notice pump, clean up, close the listen
    /// connection and the pool.
    pub async fn end(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("engine task ended abnormally: {e}");
            }
        }

        let result = self.cleanup().await;

        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            listener.close().await;
        }
        self.shared.db.close().await;
        info!("engine on channel {} shut down", self.shared.config.channel);
        result
    }
}
