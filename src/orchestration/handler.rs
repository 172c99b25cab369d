use async_trait::async_trait;
use std::sync::Arc;

use super::{EventMonitor, EventProcessor, WorkerExecutor};
use crate::config::ProcessingConfig;
use crate::error::Result;
use crate::queue::{ScheduledTask, Task, TaskHandler};
use crate::store::{EventStore, ProjectStore};
use crate::substrate::ExecutionSubstrate;

/// Routes every queue task kind to its handler.
pub struct EventflowTaskHandler {
    processor: EventProcessor,
    executor: WorkerExecutor,
    monitor: EventMonitor,
}

impl EventflowTaskHandler {
    pub fn new(processor: EventProcessor, executor: WorkerExecutor, monitor: EventMonitor) -> Self {
        Self {
            processor,
            executor,
            monitor,
        }
    }

    /// Wires all three handlers against the same collaborators.
    pub fn from_parts(
        events: Arc<dyn EventStore>,
        projects: Arc<dyn ProjectStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        delays: ProcessingConfig,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self::new(
            EventProcessor::new(Arc::clone(&events), projects, delays.clone()),
            WorkerExecutor::new(Arc::clone(&events), substrate, delays.clone(), default_namespace),
            EventMonitor::new(events, delays),
        )
    }
}

#[async_trait]
impl TaskHandler for EventflowTaskHandler {
    async fn handle(&self, task: &Task) -> Result<Vec<ScheduledTask>> {
        match task {
            Task::EventProcess(args) => self.processor.process_event(&args.event_id).await,
            Task::ExecuteWorker(args) => {
                self.executor
                    .execute_worker(&args.event_id, &args.worker_name)
                    .await
            }
            Task::MonitorWorker(args) => {
                self.monitor
                    .monitor_worker(&args.event_id, &args.worker_name)
                    .await
            }
            Task::MonitorEvent(args) => self.monitor.monitor_event(&args.event_id).await,
        }
    }
}
