//! Update loop.
//!
//! Exactly one loop runs per engine. Each tick runs queued trigger drops,
//! drains the pending set and refreshes every due cache concurrently, then
//! waits for all of them before the next tick starts. A tick with nothing
//! to refresh is followed by an idle wait of `stagnant_timeout_ms`, cut
//! short when new work is queued.

use crate::engine::EngineShared;
use crate::error::Result;
use crate::query_cache::QueryCache;
use futures_util::future::join_all;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Outcome of one tick.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct TickReport {
    pub refreshed: usize,
    pub failed: usize,
    /// Shortest wait until a throttled cache becomes due.
    pub deferred: Option<Duration>,
}

pub(crate) async fn run(shared: Arc<EngineShared>, mut shutdown: watch::Receiver<bool>) {
    info!("update loop started on channel {}", shared.config.channel);
    let idle = shared.config.stagnant_timeout();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let report = tick(&shared).await;
        if report.refreshed > 0 {
            tokio::task::yield_now().await;
            continue;
        }

        shared.prune_reassembly();
        let wait = report.deferred.map_or(idle, |d| d.min(idle));
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shared.wake.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!("update loop stopped on channel {}", shared.config.channel);
}

pub(crate) async fn tick(shared: &EngineShared) -> TickReport {
    let drops = shared.take_ddl();
    if !drops.is_empty() {
        debug!("dropping {} triggers", drops.len());
        shared.run_ddl(drops).await;
    }

    let (due, deferred) = shared.drain_pending(Instant::now());
    if due.is_empty() {
        return TickReport {
            deferred,
            ..TickReport::default()
        };
    }

    debug!("refreshing {} caches", due.len());
    let results = join_all(due.iter().map(|cache| refresh_cache(shared, cache))).await;

    let mut report = TickReport {
        refreshed: results.len(),
        deferred,
        ..TickReport::default()
    };
    for result in results {
        if let Err(e) = result {
            report.failed += 1;
            shared.report(e);
        }
    }
    report
}

/// Bind a new cache's tables on its first refresh, then refresh it.
async fn refresh_cache(shared: &EngineShared, cache: &Arc<QueryCache>) -> Result<()> {
    if cache.tables().is_none() {
        let dependencies = resolve_dependencies(shared, cache).await;
        let ddl = shared.bind_cache(cache, &dependencies);
        shared.run_ddl(ddl).await;
    }
    cache.refresh(shared.db.as_ref()).await
}

async fn resolve_dependencies(shared: &EngineShared, cache: &QueryCache) -> Vec<String> {
    if let Some(tables) = shared.cached_dependencies(cache.signature()) {
        return tables;
    }
    match shared.db.resolve_dependencies(cache.query(), cache.values()).await {
        Ok(tables) => {
            shared.store_dependencies(cache.signature(), tables.clone());
            tables
        }
        Err(e) => {
            warn!("could not resolve tables for {}: {e}", cache.signature());
            shared.report(e);
            Vec::new()
        }
    }
}
