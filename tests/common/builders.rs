//! Test harness for running a whole in-memory system.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use eventflow_core::bootstrap::{EventflowSystem, SystemComponents};
use eventflow_core::config::{ConfigManager, EventflowConfig};
use eventflow_core::logs::MemoryLogStore;
use eventflow_core::models::{Event, EventSubscription, Project, WorkerSpec};
use eventflow_core::store::{EventStore, MemoryStore, ProjectStore};
use eventflow_core::substrate::MemorySubstrate;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "ns";

/// A running system plus typed handles on its in-memory collaborators.
pub struct TestSystem {
    pub system: Arc<EventflowSystem>,
    pub store: Arc<MemoryStore>,
    pub substrate: Arc<MemorySubstrate>,
    pub logs: Arc<MemoryLogStore>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<eventflow_core::Result<()>>>,
}

impl TestSystem {
    pub async fn start() -> Self {
        Self::start_with(EventflowConfig::default()).await
    }

    pub async fn start_with(mut config: EventflowConfig) -> Self {
        eventflow_core::logging::init_structured_logging();
        config.queue.consumer_id = Some("test-consumer".into());
        let store = Arc::new(MemoryStore::new());
        let substrate = Arc::new(MemorySubstrate::new());
        let logs = Arc::new(MemoryLogStore::new());
        let components = SystemComponents {
            events: store.clone(),
            projects: store.clone(),
            substrate: substrate.clone(),
            logs: logs.clone(),
            ..SystemComponents::in_memory()
        };
        let manager = ConfigManager::from_config(config, "test").expect("valid test config");
        let system = Arc::new(EventflowSystem::assemble(manager, components));

        let shutdown = CancellationToken::new();
        let runner = Arc::clone(&system);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { runner.run(token).await });

        Self {
            system,
            store,
            substrate,
            logs,
            shutdown,
            handle: Some(handle),
        }
    }

    pub async fn add_project(&self, id: &str, source: &str) -> Project {
        let project = project(id, source);
        ProjectStore::create(self.store.as_ref(), &project)
            .await
            .expect("project created");
        project
    }

    pub async fn event(&self, id: &str) -> Event {
        EventStore::get(self.store.as_ref(), id)
            .await
            .expect("event exists")
    }

    /// Polls the event until `check` holds. Time auto-advances under a paused
    /// clock, so the bound is in simulated time.
    pub async fn wait_for_event<F>(&self, id: &str, limit: Duration, check: F) -> Event
    where
        F: Fn(&Event) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let event = self.event(id).await;
            if check(&event) {
                return event;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached for event {id}: {event:?}"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn wait_until<F>(&self, limit: Duration, check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn stop(mut self) -> eventflow_core::Result<()> {
        self.shutdown.cancel();
        match self.handle.take() {
            Some(handle) => handle.await.expect("system task joins"),
            None => Ok(()),
        }
    }
}

pub fn project(id: &str, source: &str) -> Project {
    Project::new(id, NAMESPACE)
        .with_worker_template(WorkerSpec::default())
        .with_subscription(EventSubscription {
            source: source.into(),
            ..Default::default()
        })
}
