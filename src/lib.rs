/// livepg - Live Queries over PostgreSQL
///
/// Turns parameterized SQL queries into continuously updated result sets.
/// Row-level triggers publish change notices over LISTEN/NOTIFY; the engine
/// reassembles them, marks the affected query caches pending, refreshes them
/// in barrier-synchronized ticks and sends each subscriber a minimal edit
/// script (added, removed, moved, copied, changed rows) with the new snapshot.

pub mod error;
pub mod config;
pub mod row;
pub mod key_selector;
pub mod condition;
pub mod notice;
pub mod reassembler;
pub mod sql;
pub mod triggers;
pub mod changeset;
pub mod diff;
pub mod database;
pub mod listener;
pub mod query_cache;
mod scheduler;
pub mod subscription;
pub mod engine;

#[cfg(test)]
mod testing;

pub use error::{LiveError, Result};
pub use config::EngineConfig;
pub use row::{HashedRow, Row, RowKey};
pub use key_selector::KeySelector;
pub use condition::{Condition, Filter};
pub use notice::{ChangeNotice, NoticeOperation, RowChange};
pub use reassembler::Reassembler;
pub use changeset::{EditScript, RowDiff};
pub use database::{Database, PgDatabase, RawRow};
pub use subscription::{Subscription, SubscriptionEvent, SubscriptionHandle, TriggerRule};
pub use engine::LivePg;

// WebSocket gateway modules - only when server feature is enabled
#[cfg(feature = "server")]
pub mod messages;
#[cfg(feature = "server")]
pub mod websocket;
#[cfg(feature = "server")]
pub mod server;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::row::row_from_value;
    use crate::testing::{test_config, MockDatabase};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const QUERY: &str = "SELECT id, name FROM users";

    async fn setup() -> (LivePg, Arc<MockDatabase>) {
        let db = Arc::new(MockDatabase::new());
        db.define(QUERY, &["users"], |tables, _| tables.rows("users"));
        let engine = LivePg::start(test_config(), db.clone()).await.unwrap();
        (engine, db)
    }

    fn select_users(engine: &LivePg) -> Subscription {
        engine
            .select(QUERY, vec![], KeySelector::column("id"), vec![TriggerRule::table("users")], None)
            .unwrap()
    }

    async fn next_update(sub: &mut Subscription) -> (RowDiff, Arc<Vec<Row>>) {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for an update")
            .expect("subscription closed");
        match event {
            SubscriptionEvent::Update { diff, rows } => (diff, rows),
            SubscriptionEvent::Error(e) => panic!("unexpected error {e}"),
        }
    }

    fn notify(engine: &LivePg, parts: Vec<String>) {
        assert!(parts.len() > 1, "notice should span several parts");
        for part in parts.iter().rev() {
            engine.handle_notice(part);
        }
    }

    fn row(value: serde_json::Value) -> Row {
        row_from_value(value)
    }

    #[tokio::test]
    async fn test_insert_update_delete_scenario() {
        let (engine, db) = setup().await;
        let mut sub = select_users(&engine);

        let (diff, rows) = next_update(&mut sub).await;
        assert!(diff.is_empty());
        assert!(rows.is_empty());

        notify(&engine, db.insert("users", json!({"id": 1, "name": "a"})));
        let (diff, rows) = next_update(&mut sub).await;
        assert_eq!(diff.added, vec![row(json!({"id": 1, "name": "a"}))]);
        assert!(diff.removed.is_empty() && diff.moved.is_empty() && diff.changed.is_empty());
        assert_eq!(*rows, vec![row(json!({"id": 1, "name": "a"}))]);

        notify(&engine, db.update("users", json!(1), json!({"name": "b"})));
        let (diff, rows) = next_update(&mut sub).await;
        assert_eq!(diff.changed, vec![row(json!({"id": 1, "name": "b"}))]);
        assert!(diff.added.is_empty() && diff.removed.is_empty());
        assert_eq!(*rows, vec![row(json!({"id": 1, "name": "b"}))]);

        notify(&engine, db.delete("users", json!(1)));
        let (diff, rows) = next_update(&mut sub).await;
        assert_eq!(diff.removed, vec![row(json!({"id": 1, "name": "b"}))]);
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_invalidation_refreshes_once() {
        let (engine, db) = setup().await;
        let mut sub = select_users(&engine);
        next_update(&mut sub).await;
        let before = db.refresh_count(QUERY);

        for _ in 0..10 {
            sub.invalidate();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(db.refresh_count(QUERY), before + 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_snapshot() {
        let (engine, db) = setup().await;
        let mut first = select_users(&engine);
        next_update(&mut first).await;
        notify(&engine, db.insert("users", json!({"id": 1, "name": "a"})));
        next_update(&mut first).await;

        let mut second = select_users(&engine);
        assert_eq!(engine.cache_count(), 1);
        let (diff, rows) = next_update(&mut second).await;
        assert_eq!(diff.added, vec![row(json!({"id": 1, "name": "a"}))]);
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_evicted_cache_starts_fresh() {
        let (engine, db) = setup().await;
        let mut sub = select_users(&engine);
        next_update(&mut sub).await;
        notify(&engine, db.insert("users", json!({"id": 1, "name": "a"})));
        next_update(&mut sub).await;

        assert!(sub.stop());
        assert_eq!(engine.cache_count(), 0);
        assert!(sub.recv().await.is_none());

        db.insert("users", json!({"id": 2, "name": "b"}));
        let mut again = select_users(&engine);
        let (diff, rows) = next_update(&mut again).await;
        assert_eq!(diff.added.len(), 2);
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_condition_filters_notices() {
        let (engine, db) = setup().await;
        let rule = TriggerRule::table("users").with_condition(Condition::parse("name = 'watched'").unwrap());
        let mut sub = engine
            .select(QUERY, vec![], KeySelector::column("id"), vec![rule], None)
            .unwrap();
        next_update(&mut sub).await;
        let refreshes = db.refresh_count(QUERY);

        notify(&engine, db.insert("users", json!({"id": 1, "name": "ignored"})));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(db.refresh_count(QUERY), refreshes);

        notify(&engine, db.insert("users", json!({"id": 2, "name": "watched"})));
        let (_, rows) = next_update(&mut sub).await;
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_attached_notice_stream() {
        let (engine, db) = setup().await;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        engine.attach_notices(rx);

        let mut sub = select_users(&engine);
        next_update(&mut sub).await;
        for part in db.insert("users", json!({"id": 7, "name": "g"})) {
            tx.send(part).unwrap();
        }
        let (diff, _) = next_update(&mut sub).await;
        assert_eq!(diff.added.len(), 1);

        engine.end().await.unwrap();
        assert!(sub.recv().await.is_none());
        assert!(engine.bound_tables().is_empty());
    }
}
