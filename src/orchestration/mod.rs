//! # Orchestration
//!
//! The task handlers that move Events and Workers forward, and the
//! reconciler that follows execution units on the substrate.
//!
//! ## Components
//!
//! - [`EventProcessor`]: ACCEPTED Event to Workers plus PROCESSING, once
//! - [`WorkerExecutor`]: PENDING Worker to a running unit plus RUNNING
//! - [`EventMonitor`]: periodic completion checks for Events and Workers
//! - [`EventflowTaskHandler`]: exhaustive dispatch of queue tasks to the above
//! - [`PodReconciler`]: list-then-watch loops writing terminal status and
//!   scheduling deferred unit deletion
//!
//! Handlers are safe to re-run. Each one decides what to do from the
//! persisted status of the entity it touches, never from queue state.

pub mod event_processor;
pub mod handler;
pub mod monitor;
pub mod reconciler;
pub mod worker_executor;

pub use event_processor::{compute_workers, EventProcessor};
pub use handler::EventflowTaskHandler;
pub use monitor::EventMonitor;
pub use reconciler::{PodReconciler, UnitCategory, UnitTracker};
pub use worker_executor::WorkerExecutor;
