//! # System Bootstrap
//!
//! Assembles stores, task queue, heartbeat registry, substrate, task handler,
//! consumer and reconciler from one configuration, and runs the long-lived
//! loops until shutdown or a fatal consumer error.
//!
//! ```rust,no_run
//! use eventflow_core::bootstrap::{EventflowSystem, SystemComponents};
//! use eventflow_core::config::ConfigManager;
//! use eventflow_core::substrate::MemorySubstrate;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::load()?;
//! let components = SystemComponents::connect(config.config(), Arc::new(MemorySubstrate::new())).await?;
//! let system = EventflowSystem::assemble(config, components);
//! system.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::background::{BackgroundStats, BackgroundTasks};
use crate::config::{ConfigManager, EventflowConfig};
use crate::database::{DatabaseConnection, DatabaseMigrations};
use crate::error::Result;
use crate::events::EventsService;
use crate::logging::log_error;
use crate::logs::{LogStore, LogStreamer, MemoryLogStore, PgLogStore};
use crate::orchestration::{EventflowTaskHandler, PodReconciler, UnitCategory};
use crate::queue::{
    HeartbeatRegistry, MemoryHeartbeatRegistry, MemoryTaskQueue, PgTaskQueue,
    RedisHeartbeatRegistry, TaskConsumer, TaskConsumerConfig, TaskQueue,
};
use crate::store::{EventStore, MemoryStore, PgStore, ProjectStore};
use crate::substrate::{ExecutionSubstrate, MemorySubstrate};

/// The collaborators a system runs against.
#[derive(Clone)]
pub struct SystemComponents {
    pub events: Arc<dyn EventStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub registry: Arc<dyn HeartbeatRegistry>,
    pub substrate: Arc<dyn ExecutionSubstrate>,
    pub logs: Arc<dyn LogStore>,
}

impl SystemComponents {
    /// Everything in process. Used by tests and single-node setups.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            events: store.clone(),
            projects: store,
            queue: Arc::new(MemoryTaskQueue::new()),
            registry: Arc::new(MemoryHeartbeatRegistry::new()),
            substrate: Arc::new(MemorySubstrate::new()),
            logs: Arc::new(MemoryLogStore::new()),
        }
    }

    /// PostgreSQL stores and queue plus the Redis heartbeat registry.
    pub async fn connect(
        config: &EventflowConfig,
        substrate: Arc<dyn ExecutionSubstrate>,
    ) -> Result<Self> {
        let database = DatabaseConnection::connect(&config.database).await?;
        if config.database.run_migrations {
            DatabaseMigrations::run_all(database.pool()).await?;
        }
        let pool = database.pool().clone();
        let store = Arc::new(PgStore::new(pool.clone()));
        let registry =
            RedisHeartbeatRegistry::connect(&config.redis.url, config.redis.heartbeat_key.clone())
                .await?;

        Ok(Self {
            events: store.clone(),
            projects: store,
            queue: Arc::new(PgTaskQueue::new(pool.clone())),
            registry: Arc::new(registry),
            substrate,
            logs: Arc::new(PgLogStore::new(pool)),
        })
    }
}

/// Point-in-time view of a running system.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatus {
    pub environment: String,
    pub consumer_id: String,
    pub processed_tasks: u64,
    pub failed_tasks: usize,
    pub worker_units: usize,
    pub job_units: usize,
    pub pending_deletions: usize,
    pub background: BackgroundStats,
}

pub struct EventflowSystem {
    config_manager: Arc<ConfigManager>,
    background: Arc<BackgroundTasks>,
    consumer: Arc<TaskConsumer>,
    reconciler: Arc<PodReconciler>,
    service: Arc<EventsService>,
}

impl std::fmt::Debug for EventflowSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventflowSystem")
            .field("environment", &self.config_manager.environment())
            .field("consumer", &self.consumer)
            .field("reconciler", &self.reconciler)
            .finish()
    }
}

impl EventflowSystem {
    pub fn assemble(config_manager: Arc<ConfigManager>, components: SystemComponents) -> Self {
        let config = config_manager.config();
        let background = Arc::new(BackgroundTasks::new(
            "eventflow",
            config.reconciler.max_background_tasks,
        ));

        let handler = Arc::new(EventflowTaskHandler::from_parts(
            Arc::clone(&components.events),
            Arc::clone(&components.projects),
            Arc::clone(&components.substrate),
            config.processing.clone(),
            config.substrate.default_namespace.clone(),
        ));
        let consumer = Arc::new(TaskConsumer::new(
            TaskConsumerConfig::from_config(config),
            Arc::clone(&components.queue),
            Arc::clone(&components.registry),
            handler,
        ));
        let reconciler = Arc::new(PodReconciler::new(
            Arc::clone(&components.events),
            Arc::clone(&components.substrate),
            Arc::clone(&background),
            config.reconciler.clone(),
        ));
        let logs = LogStreamer::new(
            Arc::clone(&components.events),
            Arc::clone(&components.logs),
            &config.logs,
        );
        let service = Arc::new(EventsService::new(
            components.events,
            components.projects,
            components.queue,
            components.substrate,
            Arc::clone(&background),
            logs,
            config.substrate.default_namespace.clone(),
        ));

        Self {
            config_manager,
            background,
            consumer,
            reconciler,
            service,
        }
    }

    pub fn events(&self) -> Arc<EventsService> {
        Arc::clone(&self.service)
    }

    pub fn consumer(&self) -> &Arc<TaskConsumer> {
        &self.consumer
    }

    pub fn reconciler(&self) -> &Arc<PodReconciler> {
        &self.reconciler
    }

    pub fn background(&self) -> &Arc<BackgroundTasks> {
        &self.background
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    /// Runs the consumer and reconciler until `shutdown` fires or the
    /// consumer fails fatally. Pending background work is aborted on exit;
    /// the reconciler's next resync reschedules anything that was cut off.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            environment = %self.config_manager.environment(),
            consumer_id = %self.consumer.consumer_id(),
            "🚀 Eventflow system starting"
        );
        let stop = shutdown.child_token();
        let reconciler = tokio::spawn(Arc::clone(&self.reconciler).run(stop.clone()));

        let outcome = Arc::clone(&self.consumer).run(stop.clone()).await;
        if let Err(e) = &outcome {
            log_error("task_consumer", "run", &e.to_string(), Some("shutting down"));
        }
        stop.cancel();

        match reconciler.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_error("pod_reconciler", "run", &e.to_string(), None),
            Err(e) => error!("Reconciler task failed to join: {}", e),
        }
        self.background.abort_all();
        info!(status = ?self.status(), "🛑 Eventflow system stopped");
        outcome
    }

    pub fn status(&self) -> SystemStatus {
        let workers = self.reconciler.tracker(UnitCategory::Worker);
        let jobs = self.reconciler.tracker(UnitCategory::Job);
        SystemStatus {
            environment: self.config_manager.environment().to_string(),
            consumer_id: self.consumer.consumer_id().to_string(),
            processed_tasks: self.consumer.processed_count(),
            failed_tasks: self.consumer.failed_tasks().len(),
            worker_units: workers.capacity_count(),
            job_units: jobs.capacity_count(),
            pending_deletions: workers.pending_deletion_count() + jobs.pending_deletion_count(),
            background: self.background.stats(),
        }
    }
}
