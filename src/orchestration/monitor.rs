//! Periodic completion checks. Both handlers reschedule themselves until the
//! Event or Worker they watch has finished.

use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::ProcessingConfig;
use crate::error::{EventflowError, Result};
use crate::logging::{log_event_operation, log_worker_operation};
use crate::queue::{ScheduledTask, Task};
use crate::store::EventStore;

pub struct EventMonitor {
    events: Arc<dyn EventStore>,
    delays: ProcessingConfig,
}

impl EventMonitor {
    pub fn new(events: Arc<dyn EventStore>, delays: ProcessingConfig) -> Self {
        Self { events, delays }
    }

    #[instrument(skip(self))]
    pub async fn monitor_event(&self, event_id: &str) -> Result<Vec<ScheduledTask>> {
        let event = match self.events.get(event_id).await {
            Ok(event) => event,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        if event.is_complete() {
            log_event_operation(
                "monitor_event",
                &event.id,
                Some(&event.project_id),
                "COMPLETE",
            );
            return Ok(Vec::new());
        }
        debug!(status = %event.status, "Event still in progress");
        Ok(vec![Task::monitor_event(event_id).after(self.delays.monitor_event_delay())])
    }

    #[instrument(skip(self))]
    pub async fn monitor_worker(
        &self,
        event_id: &str,
        worker_name: &str,
    ) -> Result<Vec<ScheduledTask>> {
        let event = match self.events.get(event_id).await {
            Ok(event) => event,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let worker = event.workers.get(worker_name).ok_or_else(|| {
            EventflowError::InvariantViolation(format!(
                "worker {worker_name:?} does not exist on event {event_id:?}"
            ))
        })?;

        let phase = worker.phase();
        if phase.is_terminal() {
            log_worker_operation("monitor_worker", event_id, worker_name, phase.as_str());
            return Ok(Vec::new());
        }
        Ok(vec![
            Task::monitor_worker(event_id, worker_name).after(self.delays.monitor_worker_delay())
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, EventStatus, Worker, WorkerPhase, WorkerSpec, WorkerStatus};
    use crate::store::MemoryStore;

    async fn fixture() -> (EventMonitor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut event = Event::new("github", "push").with_project("p1");
        event.id = "e1".into();
        event.status = EventStatus::Processing;
        event
            .workers
            .insert("default".into(), Worker::new(WorkerSpec::default()));
        EventStore::create(store.as_ref(), &event).await.unwrap();
        (EventMonitor::new(store.clone(), ProcessingConfig::default()), store)
    }

    #[tokio::test]
    async fn test_monitors_reschedule_until_terminal() {
        let (monitor, store) = fixture().await;
        assert_eq!(monitor.monitor_event("e1").await.unwrap().len(), 1);
        assert_eq!(monitor.monitor_worker("e1", "default").await.unwrap().len(), 1);

        store
            .update_worker_status("e1", "default", &WorkerStatus::with_phase(WorkerPhase::Failed))
            .await
            .unwrap();
        assert!(monitor.monitor_event("e1").await.unwrap().is_empty());
        assert!(monitor.monitor_worker("e1", "default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_entities() {
        let (monitor, _) = fixture().await;
        assert!(monitor.monitor_event("missing").await.unwrap().is_empty());
        assert!(monitor.monitor_worker("missing", "default").await.unwrap().is_empty());
        let err = monitor.monitor_worker("e1", "ghost").await.unwrap_err();
        assert!(matches!(err, EventflowError::InvariantViolation(_)));
    }
}
