//! # Domain Models
//!
//! Events own Workers; Workers own Jobs. All three are persisted as one
//! document per Event (see [`crate::store`]).

pub mod event;
pub mod job;
pub mod log_entry;
pub mod project;
pub mod worker;

pub use event::{Event, EventGitConfig, EventStatus};
pub use job::{Job, JobPhase, JobSpec, JobStatus};
pub use log_entry::{LogCriteria, LogEntry, LogsSelector};
pub use project::{EventSubscription, Project, ProjectSpec};
pub use worker::{
    ContainerSpec, GitConfig, JobPolicies, LogLevel, Worker, WorkerPhase, WorkerSpec,
    WorkerStatus, WorkerSubstrateConfig,
};
