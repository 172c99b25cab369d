//! Caller-facing behaviour of an assembled system: configuration loading,
//! bulk operations and log access.

mod common;

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use common::{project, TestSystem, NAMESPACE};
use eventflow_core::bootstrap::{EventflowSystem, SystemComponents};
use eventflow_core::config::{ConfigManager, EventflowConfig};
use eventflow_core::constants::worker_unit_name;
use eventflow_core::models::{Event, LogsSelector, WorkerPhase};
use eventflow_core::store::{EventsSelector, ProjectStore};
use eventflow_core::ErrorKind;
use futures::StreamExt;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_system_assembles_from_layered_configuration() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("eventflow.toml"),
        "[substrate]\ndefault_namespace = \"brigade\"\n\n[queue]\nconcurrent_handlers = 2\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("eventflow.staging.toml"),
        "[reconciler]\ndeletion_grace_seconds = 5\n",
    )
    .unwrap();
    let overrides = HashMap::from([(
        "EVENTFLOW__QUEUE__CONSUMER_ID".to_string(),
        "staging-1".to_string(),
    )]);

    let manager =
        ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "staging", overrides)
            .unwrap();
    assert_eq!(manager.environment(), "staging");
    assert_eq!(manager.config().substrate.default_namespace, "brigade");
    assert_eq!(manager.config().reconciler.deletion_grace_seconds, 5);

    let system = EventflowSystem::assemble(manager, SystemComponents::in_memory());
    assert_eq!(system.consumer().consumer_id(), "staging-1");
    assert_eq!(system.reconciler().deletion_grace(), Duration::from_secs(5));

    let status = system.status();
    assert_eq!(status.environment, "staging");
    assert_eq!(status.processed_tasks, 0);
    assert_eq!(status.pending_deletions, 0);
}

#[tokio::test]
async fn test_projects_without_namespace_use_configured_default() {
    let mut config = EventflowConfig::default();
    config.substrate.default_namespace = "fallback".into();
    let manager = ConfigManager::from_config(config, "test").unwrap();
    let components = SystemComponents::in_memory();
    let mut unscoped = project("p1", "github");
    unscoped.namespace.clear();
    components.projects.create(&unscoped).await.unwrap();

    let system = EventflowSystem::assemble(manager, components);
    let created = system
        .events()
        .create(Event::new("github", "push").with_project("p1"))
        .await
        .unwrap();
    assert_eq!(created[0].namespace, "fallback");
}

#[tokio::test(start_paused = true)]
async fn test_bulk_cancel_by_phase() {
    let harness = TestSystem::start().await;
    harness.add_project("p1", "github").await;

    let events = harness.system.events();
    let first = events
        .create(Event::new("github", "push").with_project("p1"))
        .await
        .unwrap()
        .remove(0);
    let unit_name = worker_unit_name(&first.id, "default");
    harness
        .wait_for_event(&first.id, Duration::from_secs(60), |e| {
            e.workers
                .get("default")
                .is_some_and(|w| w.phase() == WorkerPhase::Running)
        })
        .await;

    let err = events
        .cancel_many(&EventsSelector::for_project("p1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let canceled = events
        .cancel_many(&EventsSelector::for_project("p1").with_phases([WorkerPhase::Running]))
        .await
        .unwrap();
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled[0].workers["default"].phase(), WorkerPhase::Aborted);

    // Unit cleanup for bulk calls happens in the background.
    let substrate = harness.substrate.clone();
    harness
        .wait_until(Duration::from_secs(10), move || {
            substrate.unit(NAMESPACE, &unit_name).is_none()
        })
        .await;

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_logs_are_served_and_streamed_through_the_service() {
    let harness = TestSystem::start().await;
    ProjectStore::create(harness.store.as_ref(), &project("p1", "github"))
        .await
        .unwrap();
    let events = harness.system.events();
    let event = events
        .create(Event::new("github", "push").with_project("p1"))
        .await
        .unwrap()
        .remove(0);

    let worker_logs = LogsSelector::worker().criteria(&event.id);
    harness.logs.append_line(&worker_logs, "cloning");
    harness.logs.append_line(&worker_logs, "building");
    harness
        .logs
        .append_line(&LogsSelector::job("test").criteria(&event.id), "job output");

    let lines: Vec<String> = events
        .get_logs(&event.id, &LogsSelector::worker())
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.message)
        .collect();
    assert_eq!(lines, vec!["cloning", "building"]);

    let cancel = CancellationToken::new();
    let mut stream = events
        .stream_logs(&event.id, &LogsSelector::job("test"), cancel.clone())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().message, "job output");

    harness
        .logs
        .append_line(&LogsSelector::job("test").criteria(&event.id), "more output");
    assert_eq!(stream.next().await.unwrap().message, "more output");

    cancel.cancel();
    assert!(stream.next().await.is_none());

    let err = events
        .get_logs("missing", &LogsSelector::worker())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    harness.stop().await.unwrap();
}
