//! # Task Queue
//!
//! At-least-once, optionally delayed delivery of the four processing task
//! kinds. The queue gives no ordering guarantee and keeps no deduplication
//! state: every handler must be safe to re-run, judged against the persisted
//! status of the entity it touches.
//!
//! ## Components
//!
//! - [`Task`]: closed set of task kinds with typed arguments
//! - [`TaskQueue`]: submit/receive/ack/retry/reclaim boundary
//!   ([`MemoryTaskQueue`], [`PgTaskQueue`])
//! - [`TaskConsumer`]: concurrent handler loops, retry with backoff,
//!   heartbeat and dead-consumer cleaner
//! - [`HeartbeatRegistry`]: shared, score-ordered liveness registry
//!   ([`MemoryHeartbeatRegistry`], [`RedisHeartbeatRegistry`])

pub mod backoff;
pub mod consumer;
pub mod heartbeat;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

pub use backoff::Backoff;
pub use consumer::{FailedTask, TaskConsumer, TaskConsumerConfig, TaskHandler};
pub use heartbeat::{HeartbeatRegistry, MemoryHeartbeatRegistry, RedisHeartbeatRegistry};
pub use memory::MemoryTaskQueue;
pub use postgres::PgTaskQueue;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventProcessArgs {
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteWorkerArgs {
    pub event_id: String,
    pub worker_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorWorkerArgs {
    pub event_id: String,
    pub worker_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorEventArgs {
    pub event_id: String,
}

/// One unit of asynchronous processing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "args")]
pub enum Task {
    EventProcess(EventProcessArgs),
    ExecuteWorker(ExecuteWorkerArgs),
    MonitorWorker(MonitorWorkerArgs),
    MonitorEvent(MonitorEventArgs),
}

impl Task {
    pub fn event_process(event_id: impl Into<String>) -> Self {
        Task::EventProcess(EventProcessArgs {
            event_id: event_id.into(),
        })
    }

    pub fn execute_worker(event_id: impl Into<String>, worker_name: impl Into<String>) -> Self {
        Task::ExecuteWorker(ExecuteWorkerArgs {
            event_id: event_id.into(),
            worker_name: worker_name.into(),
        })
    }

    pub fn monitor_worker(event_id: impl Into<String>, worker_name: impl Into<String>) -> Self {
        Task::MonitorWorker(MonitorWorkerArgs {
            event_id: event_id.into(),
            worker_name: worker_name.into(),
        })
    }

    pub fn monitor_event(event_id: impl Into<String>) -> Self {
        Task::MonitorEvent(MonitorEventArgs {
            event_id: event_id.into(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::EventProcess(_) => "EventProcess",
            Task::ExecuteWorker(_) => "ExecuteWorker",
            Task::MonitorWorker(_) => "MonitorWorker",
            Task::MonitorEvent(_) => "MonitorEvent",
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            Task::EventProcess(args) => &args.event_id,
            Task::ExecuteWorker(args) => &args.event_id,
            Task::MonitorWorker(args) => &args.event_id,
            Task::MonitorEvent(args) => &args.event_id,
        }
    }

    /// Schedules this task to become visible after `delay`.
    pub fn after(self, delay: Duration) -> ScheduledTask {
        ScheduledTask {
            task: self,
            delay: Some(delay),
        }
    }

    pub fn now(self) -> ScheduledTask {
        ScheduledTask {
            task: self,
            delay: None,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::EventProcess(a) => write!(f, "EventProcess({})", a.event_id),
            Task::ExecuteWorker(a) => write!(f, "ExecuteWorker({}/{})", a.event_id, a.worker_name),
            Task::MonitorWorker(a) => write!(f, "MonitorWorker({}/{})", a.event_id, a.worker_name),
            Task::MonitorEvent(a) => write!(f, "MonitorEvent({})", a.event_id),
        }
    }
}

/// A task together with its optional submission delay. Handlers return these
/// as follow-ups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub task: Task,
    pub delay: Option<Duration>,
}

/// A task as delivered by a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub task: Task,
    /// Zero on first delivery; bumped by every retry.
    pub attempt: u32,
    pub not_before: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(task: Task, delay: Option<Duration>) -> Self {
        let delay = delay
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(chrono::Duration::zero);
        Self {
            id: Uuid::new_v4(),
            task,
            attempt: 0,
            not_before: Utc::now() + delay,
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, task: Task, delay: Option<Duration>) -> Result<Uuid>;

    /// Claims the next visible task for `consumer_id`, if any.
    async fn receive(&self, consumer_id: &str) -> Result<Option<TaskEnvelope>>;

    /// Removes a claimed task for good. Returns `false` when the claim was
    /// no longer held (e.g. it was reclaimed).
    async fn ack(&self, consumer_id: &str, task_id: Uuid) -> Result<bool>;

    /// Releases a claimed task for another attempt after `delay`.
    async fn retry(&self, consumer_id: &str, task_id: Uuid, delay: Duration) -> Result<bool>;

    /// Returns every task claimed by `consumer_id` to the queue. Returns how
    /// many were released.
    async fn reclaim(&self, consumer_id: &str) -> Result<usize>;

    /// Tasks submitted and not yet acknowledged.
    async fn depth(&self) -> Result<usize>;
}
