#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Eventflow Core
//!
//! Event-driven orchestration of containerized Workers and Jobs.
//!
//! ## Overview
//!
//! An Event arrives for a Project, or for every Project subscribed to it.
//! Processing turns the Project's worker templates into concrete Workers,
//! launches one execution unit per Worker on the execution substrate, and
//! tracks each Worker and Job through its lifecycle until the Event is
//! complete.
//!
//! All processing is asynchronous. Handlers are driven by an at-least-once
//! task queue and must stay correct under duplicate, delayed and reordered
//! delivery, so every state change is judged against persisted status.
//!
//! ## Module Organization
//!
//! - [`models`] - Events, Workers, Jobs, Projects and log entries
//! - [`store`] - Event and Project persistence with conditional status writes
//! - [`queue`] - Task queue, consumer loops and the heartbeat registry
//! - [`orchestration`] - Event processor, worker executor, monitors and the unit reconciler
//! - [`substrate`] - Execution-unit boundary (create, delete, list, watch)
//! - [`logs`] - Log retrieval and live log streaming
//! - [`events`] - Caller-facing event admission and management
//! - [`bootstrap`] - Wires everything into a running system
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eventflow_core::bootstrap::{EventflowSystem, SystemComponents};
//! use eventflow_core::config::{ConfigManager, EventflowConfig};
//! use eventflow_core::models::Event;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::from_config(EventflowConfig::default(), "development")?;
//! let system = EventflowSystem::assemble(config, SystemComponents::in_memory());
//!
//! let created = system.events().create(Event::new("github", "push")).await?;
//! println!("admitted {} events", created.len());
//!
//! system.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # All tests; PostgreSQL and Redis tests need DATABASE_URL / REDIS_URL
//! ```

pub mod background;
pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod events;
pub mod logging;
pub mod logs;
pub mod models;
pub mod orchestration;
pub mod queue;
pub mod store;
pub mod substrate;

pub use background::{BackgroundStats, BackgroundTasks};
pub use bootstrap::{EventflowSystem, SystemComponents, SystemStatus};
pub use config::{ConfigManager, EventflowConfig};
pub use error::{ErrorKind, EventflowError, Result};
pub use events::EventsService;
pub use models::{
    Event, EventStatus, Job, JobPhase, LogEntry, LogsSelector, Project, Worker, WorkerPhase,
    WorkerStatus,
};
pub use orchestration::{
    EventMonitor, EventProcessor, EventflowTaskHandler, PodReconciler, WorkerExecutor,
};
pub use queue::{ScheduledTask, Task, TaskConsumer, TaskHandler, TaskQueue};
pub use store::{EventStore, EventsSelector, ProjectStore};
pub use substrate::{ExecutionSubstrate, LabelSelector, Unit, UnitPhase, WatchEvent};
