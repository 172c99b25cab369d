//! # Worker Executor
//!
//! Starts a PENDING Worker: makes sure its execution unit exists, records
//! RUNNING and asks for a later `MonitorWorker` check.
//!
//! Unit names are deterministic (`{event}-{worker}`), so a retried creation
//! collides with the unit created on the previous attempt and the conflict
//! counts as success. A unit created before a failed status write is left in
//! place; the reconciler observes it and records its status independently.
//!
//! A cancel or delete can land between reading the PENDING Worker and
//! creating its unit, finding no unit to remove. The RUNNING write is then
//! rejected (or the Event is gone), and the executor removes the unit it just
//! created.

use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::config::ProcessingConfig;
use crate::error::{EventflowError, Result};
use crate::logging::{log_unit_operation, log_worker_operation};
use crate::models::{WorkerPhase, WorkerStatus};
use crate::queue::{ScheduledTask, Task};
use crate::store::EventStore;
use crate::substrate::{ExecutionSubstrate, UnitRequest};

pub struct WorkerExecutor {
    events: Arc<dyn EventStore>,
    substrate: Arc<dyn ExecutionSubstrate>,
    delays: ProcessingConfig,
    default_namespace: String,
}

impl WorkerExecutor {
    pub fn new(
        events: Arc<dyn EventStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        delays: ProcessingConfig,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            events,
            substrate,
            delays,
            default_namespace: default_namespace.into(),
        }
    }

    fn monitor(&self, event_id: &str, worker_name: &str) -> Vec<ScheduledTask> {
        vec![Task::monitor_worker(event_id, worker_name).after(self.delays.monitor_worker_delay())]
    }

    /// Handles one `ExecuteWorker` delivery and returns the follow-ups.
    #[instrument(skip(self))]
    pub async fn execute_worker(
        &self,
        event_id: &str,
        worker_name: &str,
    ) -> Result<Vec<ScheduledTask>> {
        let event = match self.events.get(event_id).await {
            Ok(event) => event,
            Err(e) if e.is_not_found() => {
                debug!("Event no longer exists, nothing to execute");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let worker = event.workers.get(worker_name).ok_or_else(|| {
            EventflowError::InvariantViolation(format!(
                "worker {worker_name:?} does not exist on event {event_id:?}"
            ))
        })?;

        match worker.phase() {
            WorkerPhase::Pending => {}
            WorkerPhase::Running => {
                debug!("Worker already running, re-emitting monitor");
                return Ok(self.monitor(event_id, worker_name));
            }
            phase => {
                info!(%phase, "Worker already finished, ignoring delivery");
                return Ok(Vec::new());
            }
        }

        let namespace = if event.namespace.is_empty() {
            self.default_namespace.as_str()
        } else {
            event.namespace.as_str()
        };
        let request = UnitRequest::worker(
            namespace,
            &event.project_id,
            &event.id,
            worker_name,
            worker.spec.clone(),
        );
        let unit_name = request.name.clone();

        match self.substrate.create_unit(request).await {
            Ok(()) => log_unit_operation("create_unit", namespace, &unit_name, None),
            Err(e) if e.is_conflict() => {
                debug!(unit = %unit_name, "Unit already exists, treating creation as done");
            }
            Err(e) => return Err(e),
        }

        match self
            .events
            .update_worker_status(event_id, worker_name, &WorkerStatus::with_phase(WorkerPhase::Running))
            .await
        {
            Ok(true) => log_worker_operation("execute_worker", event_id, worker_name, "RUNNING"),
            Ok(false) => {
                if self.canceled_meanwhile(event_id, worker_name).await? {
                    info!(unit = %unit_name, "Worker canceled while starting, removing its unit");
                    self.remove_unit(namespace, &unit_name).await?;
                    return Ok(Vec::new());
                }
                debug!("Worker moved on before RUNNING could be recorded");
            }
            Err(e) if e.is_not_found() => {
                info!(unit = %unit_name, "Event deleted while starting worker, removing its unit");
                self.remove_unit(namespace, &unit_name).await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        }

        Ok(self.monitor(event_id, worker_name))
    }

    /// `true` when the Worker was canceled or aborted, or its Event is gone.
    async fn canceled_meanwhile(&self, event_id: &str, worker_name: &str) -> Result<bool> {
        match self.events.get(event_id).await {
            Ok(event) => Ok(event.workers.get(worker_name).map_or(true, |worker| {
                matches!(worker.phase(), WorkerPhase::Canceled | WorkerPhase::Aborted)
            })),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn remove_unit(&self, namespace: &str, unit_name: &str) -> Result<()> {
        match self.substrate.delete_unit(namespace, unit_name).await {
            Ok(()) => {
                log_unit_operation("delete_unit", namespace, unit_name, Some("canceled while starting"));
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{Event, EventStatus, Worker, WorkerSpec};
    use crate::substrate::{LabelSelector, MemorySubstrate, Unit, WatchEvent};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::time::Duration;

    /// What happens to the Event just before the unit is created.
    #[derive(Clone, Copy)]
    enum Interference {
        Cancel,
        Delete,
    }

    /// Lets a cancel or delete slip in between the executor's read and its
    /// unit creation.
    struct InterferingSubstrate {
        inner: Arc<MemorySubstrate>,
        store: Arc<crate::store::MemoryStore>,
        interference: Interference,
    }

    #[async_trait]
    impl ExecutionSubstrate for InterferingSubstrate {
        async fn create_unit(&self, request: UnitRequest) -> Result<()> {
            match self.interference {
                Interference::Cancel => {
                    self.store.cancel("e1").await?;
                }
                Interference::Delete => {
                    EventStore::delete(self.store.as_ref(), "e1").await?;
                }
            }
            self.inner.create_unit(request).await
        }

        async fn list_units(
            &self,
            namespace: Option<&str>,
            selector: &LabelSelector,
        ) -> Result<Vec<Unit>> {
            self.inner.list_units(namespace, selector).await
        }

        async fn watch_units(
            &self,
            selector: &LabelSelector,
        ) -> Result<BoxStream<'static, WatchEvent>> {
            self.inner.watch_units(selector).await
        }

        async fn delete_unit(&self, namespace: &str, name: &str) -> Result<()> {
            self.inner.delete_unit(namespace, name).await
        }

        async fn delete_units(
            &self,
            namespace: Option<&str>,
            selector: &LabelSelector,
        ) -> Result<usize> {
            self.inner.delete_units(namespace, selector).await
        }
    }

    async fn fixture() -> (WorkerExecutor, Arc<crate::store::MemoryStore>, Arc<MemorySubstrate>) {
        let store = Arc::new(crate::store::MemoryStore::new());
        let mut event = Event::new("github", "push").with_project("p1");
        event.id = "e1".into();
        event.namespace = "ns".into();
        event.status = EventStatus::Processing;
        event
            .workers
            .insert("default".into(), Worker::new(WorkerSpec::default()));
        EventStore::create(store.as_ref(), &event).await.unwrap();

        let substrate = Arc::new(MemorySubstrate::new());
        let executor = WorkerExecutor::new(
            store.clone(),
            substrate.clone(),
            ProcessingConfig::default(),
            "eventflow",
        );
        (executor, store, substrate)
    }

    #[tokio::test]
    async fn test_execute_creates_unit_once() {
        let (executor, store, substrate) = fixture().await;
        let expected = vec![Task::monitor_worker("e1", "default").after(Duration::from_secs(10))];

        assert_eq!(executor.execute_worker("e1", "default").await.unwrap(), expected);
        assert!(substrate.unit("ns", "e1-default").is_some());
        let event = EventStore::get(store.as_ref(), "e1").await.unwrap();
        assert_eq!(event.workers["default"].phase(), WorkerPhase::Running);

        assert_eq!(executor.execute_worker("e1", "default").await.unwrap(), expected);
        assert_eq!(substrate.created_count(), 1);
    }

    #[tokio::test]
    async fn test_existing_unit_counts_as_created() {
        let (executor, store, substrate) = fixture().await;
        substrate
            .create_unit(UnitRequest::worker("ns", "p1", "e1", "default", WorkerSpec::default()))
            .await
            .unwrap();

        let follow_ups = executor.execute_worker("e1", "default").await.unwrap();
        assert_eq!(follow_ups.len(), 1);
        let event = EventStore::get(store.as_ref(), "e1").await.unwrap();
        assert_eq!(event.workers["default"].phase(), WorkerPhase::Running);
    }

    #[tokio::test]
    async fn test_unit_removed_when_canceled_or_deleted_during_start() {
        for interference in [Interference::Cancel, Interference::Delete] {
            let (_, store, substrate) = fixture().await;
            let executor = WorkerExecutor::new(
                store.clone(),
                Arc::new(InterferingSubstrate {
                    inner: substrate.clone(),
                    store: store.clone(),
                    interference,
                }),
                ProcessingConfig::default(),
                "eventflow",
            );

            assert!(executor.execute_worker("e1", "default").await.unwrap().is_empty());
            assert_eq!(substrate.created_count(), 1);
            assert!(substrate.unit("ns", "e1-default").is_none());
            assert_eq!(substrate.deletion_count("ns", "e1-default"), 1);
        }
    }

    #[tokio::test]
    async fn test_unknown_worker_is_an_invariant_violation() {
        let (executor, _, _) = fixture().await;
        let err = executor.execute_worker("e1", "ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_event_and_terminal_worker_are_no_ops() {
        let (executor, store, substrate) = fixture().await;
        assert!(executor.execute_worker("missing", "default").await.unwrap().is_empty());

        store
            .update_worker_status("e1", "default", &WorkerStatus::with_phase(WorkerPhase::Canceled))
            .await
            .unwrap();
        assert!(executor.execute_worker("e1", "default").await.unwrap().is_empty());
        assert_eq!(substrate.created_count(), 0);
    }

    #[tokio::test]
    async fn test_substrate_failure_propagates_as_transient() {
        let (executor, _, substrate) = fixture().await;
        substrate.fail_next_creates(1);
        let err = executor.execute_worker("e1", "default").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(executor.execute_worker("e1", "default").await.is_ok());
    }
}
