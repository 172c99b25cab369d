//! PostgreSQL and Redis backed components.
//!
//! These tests only run when `DATABASE_URL` (and, for the heartbeat registry,
//! `REDIS_URL`) point at live services; otherwise they return early.

use std::time::Duration;

use chrono::Utc;
use eventflow_core::config::DatabaseConfig;
use eventflow_core::database::{DatabaseConnection, DatabaseMigrations};
use eventflow_core::logs::{LogStore, PgLogStore};
use eventflow_core::models::{
    Event, EventStatus, LogsSelector, Project, Worker, WorkerPhase, WorkerSpec, WorkerStatus,
};
use eventflow_core::queue::{HeartbeatRegistry, PgTaskQueue, RedisHeartbeatRegistry, Task, TaskQueue};
use eventflow_core::store::{EventStore, PgStore, ProjectStore};
use serde_json::json;
use uuid::Uuid;

async fn connect() -> Option<DatabaseConnection> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let config = DatabaseConfig {
        url,
        ..DatabaseConfig::default()
    };
    let connection = DatabaseConnection::connect(&config)
        .await
        .expect("database reachable");
    DatabaseMigrations::run_all(connection.pool())
        .await
        .expect("migrations apply");
    Some(connection)
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
async fn test_pg_store_conditional_writes() {
    let Some(db) = connect().await else {
        return;
    };
    assert!(db.health_check().await.unwrap());
    let store = PgStore::new(db.pool().clone());

    let project = Project::new(unique("project"), "ns").with_worker_template(WorkerSpec::default());
    ProjectStore::create(&store, &project).await.unwrap();
    assert!(ProjectStore::create(&store, &project).await.unwrap_err().is_conflict());

    let mut event = Event::new("github", "push").with_project(&project.id);
    event.id = unique("event");
    EventStore::create(&store, &event).await.unwrap();

    let mut workers = std::collections::BTreeMap::new();
    workers.insert("default".to_string(), Worker::new(WorkerSpec::default()));
    assert!(store
        .update_workers_and_status(&event.id, &workers, EventStatus::Processing)
        .await
        .unwrap());
    // Fan-out happens once.
    assert!(!store
        .update_workers_and_status(&event.id, &workers, EventStatus::Processing)
        .await
        .unwrap());

    let succeeded = WorkerStatus {
        phase: WorkerPhase::Succeeded,
        started: Some(Utc::now()),
        ended: Some(Utc::now()),
    };
    assert!(store
        .update_worker_status(&event.id, "default", &succeeded)
        .await
        .unwrap());
    assert!(!store
        .update_worker_status(&event.id, "default", &WorkerStatus::with_phase(WorkerPhase::Running))
        .await
        .unwrap());

    let stored = EventStore::get(&store, &event.id).await.unwrap();
    assert_eq!(stored.workers["default"].phase(), WorkerPhase::Succeeded);
    assert!(stored.is_complete());

    EventStore::delete(&store, &event.id).await.unwrap();
    assert!(EventStore::get(&store, &event.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_pg_queue_claims_are_exclusive() {
    let Some(db) = connect().await else {
        return;
    };
    let queue = PgTaskQueue::new(db.pool().clone());
    let event_id = unique("event");
    let consumer_a = unique("consumer");
    let consumer_b = unique("consumer");

    queue.submit(Task::event_process(&event_id), None).await.unwrap();
    queue
        .submit(Task::monitor_event(&event_id), Some(Duration::from_secs(3600)))
        .await
        .unwrap();

    // Other tests share the table, so drain until our task turns up.
    let mut mine = None;
    while let Some(envelope) = queue.receive(&consumer_a).await.unwrap() {
        if envelope.task == Task::event_process(&event_id) {
            mine = Some(envelope);
            break;
        }
        queue.ack(&consumer_a, envelope.id).await.unwrap();
    }
    let envelope = mine.expect("submitted task is claimable");

    assert!(!queue.ack(&consumer_b, envelope.id).await.unwrap());
    assert_eq!(queue.reclaim(&consumer_a).await.unwrap(), 1);
    assert!(!queue.ack(&consumer_a, envelope.id).await.unwrap());
}

#[tokio::test]
async fn test_pg_log_store_tails_appended_documents() {
    let Some(db) = connect().await else {
        return;
    };
    let logs = PgLogStore::new(db.pool().clone());
    let event_id = unique("event");
    let criteria = LogsSelector::worker().criteria(&event_id);

    let cursor = logs.tail(&criteria).await.unwrap();
    assert!(cursor.is_dead());

    for message in ["one", "two"] {
        logs.append(
            &criteria,
            &json!({
                "event": event_id,
                "component": criteria.component,
                "container": criteria.container,
                "message": message,
            }),
        )
        .await
        .unwrap();
    }
    let found = logs.find(&criteria).await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0]["message"], "one");

    let mut cursor = logs.tail(&criteria).await.unwrap();
    assert!(!cursor.is_dead());
    assert_eq!(cursor.try_next().await.unwrap().unwrap()["message"], "one");
    assert_eq!(cursor.try_next().await.unwrap().unwrap()["message"], "two");
    assert!(cursor.try_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_pg_log_tail_sees_every_concurrent_append() {
    let Some(db) = connect().await else {
        return;
    };
    let logs = PgLogStore::new(db.pool().clone());
    let event_id = unique("event");
    let criteria = LogsSelector::worker().criteria(&event_id);

    let mut writers = tokio::task::JoinSet::new();
    for i in 0..20 {
        let logs = logs.clone();
        let criteria = criteria.clone();
        writers.spawn(async move {
            logs.append(&criteria, &json!({ "message": format!("line {i}") }))
                .await
        });
    }
    while let Some(joined) = writers.join_next().await {
        joined.unwrap().unwrap();
    }

    let mut cursor = logs.tail(&criteria).await.unwrap();
    let mut seen = 0;
    while cursor.try_next().await.unwrap().is_some() {
        seen += 1;
    }
    assert_eq!(seen, 20);
}

#[tokio::test]
async fn test_redis_heartbeat_registry() {
    let Ok(url) = std::env::var("REDIS_URL") else {
        return;
    };
    let registry = RedisHeartbeatRegistry::connect(&url, unique("eventflow-heartbeats"))
        .await
        .expect("redis reachable");
    let stale = unique("consumer");
    let fresh = unique("consumer");
    let now = Utc::now();

    registry
        .beat(&stale, now - chrono::Duration::seconds(120))
        .await
        .unwrap();
    registry.beat(&fresh, now).await.unwrap();

    let dead = registry
        .dead_since(now - chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(dead, vec![stale.clone()]);

    registry.remove(&stale).await.unwrap();
    assert!(registry.last_beat(&stale).await.unwrap().is_none());
    assert!(registry.last_beat(&fresh).await.unwrap().is_some());
    registry.remove(&fresh).await.unwrap();
}
