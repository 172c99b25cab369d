//! # Status Store
//!
//! Persistence boundary for Event documents (Workers and Jobs nested within)
//! and the Projects they belong to.
//!
//! ## Conditional writes
//!
//! Every status write is conditional. Writes that would move a Worker or Job
//! backwards, or overwrite a terminal phase, are ignored and reported as
//! `Ok(false)`. Fan-out (`update_workers_and_status`) only lands on an Event
//! that is still ACCEPTED, so concurrent redeliveries of the same admission
//! task cannot fan out twice.
//!
//! ## Implementations
//!
//! - [`MemoryStore`] for tests and single-process deployments
//! - [`PgStore`] for PostgreSQL (JSONB documents, row locks)

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EventflowError, Result};
use crate::models::{Event, EventStatus, JobStatus, Project, Worker, WorkerPhase, WorkerStatus};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Filter for listing and bulk operations on Events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsSelector {
    #[serde(default)]
    pub project_id: String,
    /// An Event matches when any of its Workers is in one of these phases.
    #[serde(default)]
    pub worker_phases: Vec<WorkerPhase>,
}

impl EventsSelector {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            worker_phases: Vec::new(),
        }
    }

    pub fn with_phases(mut self, phases: impl IntoIterator<Item = WorkerPhase>) -> Self {
        self.worker_phases.extend(phases);
        self
    }

    /// Bulk cancel/delete must be qualified by a project and by at least one
    /// worker phase.
    pub fn ensure_qualified(&self, operation: &str) -> Result<()> {
        if self.project_id.is_empty() {
            return Err(EventflowError::bad_request(format!(
                "requests to {operation} multiple events must be qualified by project"
            )));
        }
        if self.worker_phases.is_empty() {
            return Err(EventflowError::bad_request(format!(
                "requests to {operation} multiple events must be qualified by worker phase(s)"
            )));
        }
        Ok(())
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.project_id.is_empty() && self.project_id != event.project_id {
            return false;
        }
        self.worker_phases.is_empty()
            || event
                .workers
                .values()
                .any(|w| self.worker_phases.contains(&w.phase()))
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Fails with `Conflict` when an Event with the same ID exists.
    async fn create(&self, event: &Event) -> Result<()>;

    /// Fails with `NotFound` for an unknown ID.
    async fn get(&self, id: &str) -> Result<Event>;

    async fn list(&self, selector: &EventsSelector) -> Result<Vec<Event>>;

    /// Persists the computed Workers and the new status in one write.
    /// Returns `false` when the Event was no longer ACCEPTED.
    async fn update_workers_and_status(
        &self,
        id: &str,
        workers: &BTreeMap<String, Worker>,
        status: EventStatus,
    ) -> Result<bool>;

    async fn update_worker_status(
        &self,
        id: &str,
        worker_name: &str,
        status: &WorkerStatus,
    ) -> Result<bool>;

    async fn update_job_status(
        &self,
        id: &str,
        worker_name: &str,
        job_name: &str,
        status: &JobStatus,
    ) -> Result<bool>;

    /// Cancels PENDING Workers and aborts RUNNING ones. Fails with
    /// `Conflict` when nothing was left to cancel.
    async fn cancel(&self, id: &str) -> Result<Event>;

    /// Returns the Events that were canceled.
    async fn cancel_many(&self, selector: &EventsSelector) -> Result<Vec<Event>>;

    async fn delete(&self, id: &str) -> Result<Event>;

    /// Returns the Events that were deleted.
    async fn delete_many(&self, selector: &EventsSelector) -> Result<Vec<Event>>;
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create(&self, project: &Project) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Project>;

    /// Projects with at least one subscription matching the Event.
    async fn list_subscribers(&self, event: &Event) -> Result<Vec<Project>>;
}

/// Cancels the Workers of `event` whose phase is in `phases` (all phases when
/// `None`). PENDING becomes CANCELED; RUNNING becomes ABORTED together with
/// the Worker's unfinished Jobs. Returns whether anything changed.
pub(crate) fn apply_cancellation(
    event: &mut Event,
    phases: Option<&[WorkerPhase]>,
    now: DateTime<Utc>,
) -> bool {
    let mut changed = false;
    for worker in event.workers.values_mut() {
        let current = worker.phase();
        if phases.is_some_and(|p| !p.contains(&current)) {
            continue;
        }
        let next = match current {
            WorkerPhase::Pending => WorkerPhase::Canceled,
            WorkerPhase::Running => WorkerPhase::Aborted,
            _ => continue,
        };
        worker.status.phase = next;
        worker.status.ended = Some(now);
        if next == WorkerPhase::Aborted {
            for job in worker.jobs.values_mut() {
                if !job.status.phase.is_terminal() {
                    job.status.phase = WorkerPhase::Aborted;
                    job.status.ended = Some(now);
                }
            }
        }
        changed = true;
    }
    if changed {
        event.canceled = Some(now);
    }
    changed
}

pub(crate) fn apply_worker_status(
    event: &mut Event,
    worker_name: &str,
    status: &WorkerStatus,
) -> Result<bool> {
    let worker = event.workers.get_mut(worker_name).ok_or_else(|| {
        EventflowError::not_found("Worker", format!("{}/{}", event.id, worker_name))
    })?;
    Ok(worker.status.apply(status))
}

pub(crate) fn apply_job_status(
    event: &mut Event,
    worker_name: &str,
    job_name: &str,
    status: &JobStatus,
) -> Result<bool> {
    let event_id = event.id.clone();
    let worker = event.workers.get_mut(worker_name).ok_or_else(|| {
        EventflowError::not_found("Worker", format!("{event_id}/{worker_name}"))
    })?;
    let job = worker.jobs.get_mut(job_name).ok_or_else(|| {
        EventflowError::not_found("Job", format!("{event_id}/{worker_name}/{job_name}"))
    })?;
    Ok(job.status.apply(status))
}

pub(crate) fn apply_fan_out(
    event: &mut Event,
    workers: &BTreeMap<String, Worker>,
    status: EventStatus,
) -> bool {
    if event.status != EventStatus::Accepted {
        return false;
    }
    event.workers = workers.clone();
    event.status = status;
    true
}
