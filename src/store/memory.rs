//! In-memory Status Store backed by `DashMap`.
//!
//! Conditional writes hold the shard write lock for the Event being
//! modified, which gives them the same per-document atomicity a document
//! database would.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::debug;

use super::{
    apply_cancellation, apply_fan_out, apply_job_status, apply_worker_status, EventStore,
    EventsSelector, ProjectStore,
};
use crate::error::{EventflowError, Result};
use crate::models::{Event, EventStatus, JobStatus, Project, Worker, WorkerStatus};

#[derive(Debug, Default)]
pub struct MemoryStore {
    events: DashMap<String, Event>,
    projects: DashMap<String, Project>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn create(&self, event: &Event) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.events.entry(event.id.clone()) {
            Entry::Occupied(_) => Err(EventflowError::conflict(
                "Event",
                &event.id,
                "an event with this id already exists",
            )),
            Entry::Vacant(slot) => {
                slot.insert(event.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Event> {
        self.events
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EventflowError::not_found("Event", id))
    }

    async fn list(&self, selector: &EventsSelector) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .events
            .iter()
            .filter(|e| selector.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        events.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn update_workers_and_status(
        &self,
        id: &str,
        workers: &BTreeMap<String, Worker>,
        status: EventStatus,
    ) -> Result<bool> {
        let mut event = self
            .events
            .get_mut(id)
            .ok_or_else(|| EventflowError::not_found("Event", id))?;
        Ok(apply_fan_out(event.value_mut(), workers, status))
    }

    async fn update_worker_status(
        &self,
        id: &str,
        worker_name: &str,
        status: &WorkerStatus,
    ) -> Result<bool> {
        let mut event = self
            .events
            .get_mut(id)
            .ok_or_else(|| EventflowError::not_found("Event", id))?;
        apply_worker_status(event.value_mut(), worker_name, status)
    }

    async fn update_job_status(
        &self,
        id: &str,
        worker_name: &str,
        job_name: &str,
        status: &JobStatus,
    ) -> Result<bool> {
        let mut event = self
            .events
            .get_mut(id)
            .ok_or_else(|| EventflowError::not_found("Event", id))?;
        apply_job_status(event.value_mut(), worker_name, job_name, status)
    }

    async fn cancel(&self, id: &str) -> Result<Event> {
        let mut event = self
            .events
            .get_mut(id)
            .ok_or_else(|| EventflowError::not_found("Event", id))?;
        if !apply_cancellation(event.value_mut(), None, Utc::now()) {
            return Err(EventflowError::conflict(
                "Event",
                id,
                "event has no pending or running workers left to cancel",
            ));
        }
        Ok(event.value().clone())
    }

    async fn cancel_many(&self, selector: &EventsSelector) -> Result<Vec<Event>> {
        selector.ensure_qualified("cancel")?;
        let now = Utc::now();
        let mut canceled = Vec::new();
        for mut entry in self.events.iter_mut() {
            let event = entry.value_mut();
            if event.project_id != selector.project_id {
                continue;
            }
            if apply_cancellation(event, Some(&selector.worker_phases), now) {
                canceled.push(event.clone());
            }
        }
        debug!(count = canceled.len(), project_id = %selector.project_id, "Canceled events");
        Ok(canceled)
    }

    async fn delete(&self, id: &str) -> Result<Event> {
        self.events
            .remove(id)
            .map(|(_, event)| event)
            .ok_or_else(|| EventflowError::not_found("Event", id))
    }

    async fn delete_many(&self, selector: &EventsSelector) -> Result<Vec<Event>> {
        selector.ensure_qualified("delete")?;
        let ids: Vec<String> = self
            .events
            .iter()
            .filter(|e| selector.matches(e.value()))
            .map(|e| e.key().clone())
            .collect();
        let deleted: Vec<Event> = ids
            .iter()
            .filter_map(|id| {
                self.events
                    .remove_if(id, |_, event| selector.matches(event))
                    .map(|(_, event)| event)
            })
            .collect();
        debug!(count = deleted.len(), project_id = %selector.project_id, "Deleted events");
        Ok(deleted)
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn create(&self, project: &Project) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.projects.entry(project.id.clone()) {
            Entry::Occupied(_) => Err(EventflowError::conflict(
                "Project",
                &project.id,
                "a project with this id already exists",
            )),
            Entry::Vacant(slot) => {
                slot.insert(project.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Project> {
        self.projects
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| EventflowError::not_found("Project", id))
    }

    async fn list_subscribers(&self, event: &Event) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> = self
            .projects
            .iter()
            .filter(|p| p.value().is_subscribed_to(event))
            .map(|p| p.value().clone())
            .collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, JobSpec, WorkerPhase, WorkerSpec};

    async fn seeded(store: &MemoryStore, id: &str, phases: &[(&str, WorkerPhase)]) -> Event {
        let mut event = Event::new("github", "push").with_project("p1");
        event.id = id.to_string();
        event.created = Some(Utc::now());
        EventStore::create(store, &event).await.unwrap();
        let workers = phases
            .iter()
            .map(|(name, phase)| {
                let mut worker = Worker::new(WorkerSpec::default());
                worker.status.phase = *phase;
                (name.to_string(), worker)
            })
            .collect();
        store
            .update_workers_and_status(id, &workers, EventStatus::Processing)
            .await
            .unwrap();
        EventStore::get(store, id).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_get_and_conflict() {
        let store = MemoryStore::new();
        let event = seeded(&store, "e1", &[]).await;
        assert_eq!(event.status, EventStatus::Processing);

        let err = EventStore::create(&store, &event).await.unwrap_err();
        assert!(err.is_conflict());

        let err = EventStore::get(&store, "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_worker_status_writes_are_conditional() {
        let store = MemoryStore::new();
        seeded(&store, "e1", &[("default", WorkerPhase::Pending)]).await;

        let running = WorkerStatus::with_phase(WorkerPhase::Running);
        let done = WorkerStatus::with_phase(WorkerPhase::Succeeded);
        assert!(store.update_worker_status("e1", "default", &running).await.unwrap());
        assert!(store.update_worker_status("e1", "default", &done).await.unwrap());
        assert!(!store.update_worker_status("e1", "default", &running).await.unwrap());

        let event = EventStore::get(&store, "e1").await.unwrap();
        assert_eq!(event.workers["default"].phase(), WorkerPhase::Succeeded);

        let err = store
            .update_worker_status("e1", "ghost", &running)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_job_status_requires_known_job() {
        let store = MemoryStore::new();
        seeded(&store, "e1", &[("default", WorkerPhase::Running)]).await;

        let running = WorkerStatus::with_phase(WorkerPhase::Running);
        let err = store
            .update_job_status("e1", "default", "build", &running)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        store
            .events
            .get_mut("e1")
            .unwrap()
            .workers
            .get_mut("default")
            .unwrap()
            .jobs
            .insert("build".into(), Job::new(JobSpec::default()));
        assert!(store
            .update_job_status("e1", "default", "build", &running)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cancel_conflicts_when_nothing_left() {
        let store = MemoryStore::new();
        seeded(&store, "e1", &[("default", WorkerPhase::Pending)]).await;

        let canceled = store.cancel("e1").await.unwrap();
        assert_eq!(canceled.workers["default"].phase(), WorkerPhase::Canceled);

        let err = store.cancel("e1").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_bulk_operations_are_guarded_and_scoped() {
        let store = MemoryStore::new();
        seeded(&store, "e1", &[("default", WorkerPhase::Running)]).await;
        seeded(&store, "e2", &[("default", WorkerPhase::Succeeded)]).await;

        let err = store
            .cancel_many(&EventsSelector::for_project("p1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EventflowError::BadRequest { .. }));

        let canceled = store
            .cancel_many(
                &EventsSelector::for_project("p1")
                    .with_phases([WorkerPhase::Pending, WorkerPhase::Running]),
            )
            .await
            .unwrap();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].id, "e1");

        let deleted = store
            .delete_many(&EventsSelector::for_project("p1").with_phases([WorkerPhase::Succeeded]))
            .await
            .unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].id, "e2");
        assert_eq!(store.event_count(), 1);
    }
}
