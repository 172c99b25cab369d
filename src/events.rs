//! # Events Service
//!
//! Admission and management of Events: the caller-facing side of the core.
//!
//! Creating an Event without a Project fans it out by subscription, one
//! concrete Event per subscribed Project. Each concrete Event is persisted
//! as ACCEPTED and an `EventProcess` task is submitted for it; everything
//! after that happens in the task handlers.
//!
//! Cancel and delete also remove the Event's execution units. Single-Event
//! calls do so inline; bulk calls hand the cleanup to the background set.

use chrono::Utc;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::background::BackgroundTasks;
use crate::error::{EventflowError, Result};
use crate::logging::log_event_operation;
use crate::logs::LogStreamer;
use crate::models::{Event, EventStatus, LogEntry, LogsSelector, Project};
use crate::queue::{Task, TaskQueue};
use crate::store::{EventStore, EventsSelector, ProjectStore};
use crate::substrate::{ExecutionSubstrate, LabelSelector};

pub struct EventsService {
    events: Arc<dyn EventStore>,
    projects: Arc<dyn ProjectStore>,
    queue: Arc<dyn TaskQueue>,
    substrate: Arc<dyn ExecutionSubstrate>,
    background: Arc<BackgroundTasks>,
    logs: LogStreamer,
    default_namespace: String,
}

impl std::fmt::Debug for EventsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventsService")
            .field("default_namespace", &self.default_namespace)
            .field("logs", &self.logs)
            .finish()
    }
}

impl EventsService {
    pub fn new(
        events: Arc<dyn EventStore>,
        projects: Arc<dyn ProjectStore>,
        queue: Arc<dyn TaskQueue>,
        substrate: Arc<dyn ExecutionSubstrate>,
        background: Arc<BackgroundTasks>,
        logs: LogStreamer,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            events,
            projects,
            queue,
            substrate,
            background,
            logs,
            default_namespace: default_namespace.into(),
        }
    }

    /// Admits an Event. Returns the concrete Events that were created, which
    /// is empty when an unresolved Event matches no subscription.
    #[instrument(skip(self, event), fields(source = %event.source, event_type = %event.event_type))]
    pub async fn create(&self, event: Event) -> Result<Vec<Event>> {
        if event.source.is_empty() || event.event_type.is_empty() {
            return Err(EventflowError::bad_request(
                "events require both a source and a type",
            ));
        }

        if event.project_id.is_empty() {
            let subscribers = self.projects.list_subscribers(&event).await?;
            debug!(subscribers = subscribers.len(), "Fanning out event by subscription");
            let mut created = Vec::with_capacity(subscribers.len());
            for project in subscribers {
                created.push(self.create_concrete(&event, &project).await?);
            }
            return Ok(created);
        }

        let project = self.projects.get(&event.project_id).await?;
        Ok(vec![self.create_concrete(&event, &project).await?])
    }

    async fn create_concrete(&self, template: &Event, project: &Project) -> Result<Event> {
        let mut event = template.clone();
        event.id = Uuid::new_v4().to_string();
        event.project_id = project.id.clone();
        event.namespace = if project.namespace.is_empty() {
            self.default_namespace.clone()
        } else {
            project.namespace.clone()
        };
        event.status = EventStatus::Accepted;
        event.created = Some(Utc::now());
        event.canceled = None;
        event.workers.clear();

        self.events.create(&event).await?;
        self.queue
            .submit(Task::event_process(&event.id), None)
            .await?;
        log_event_operation("create_event", &event.id, Some(&event.project_id), event.status.as_str());
        Ok(event)
    }

    pub async fn get(&self, id: &str) -> Result<Event> {
        self.events.get(id).await
    }

    pub async fn list(&self, selector: &EventsSelector) -> Result<Vec<Event>> {
        self.events.list(selector).await
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> Result<Event> {
        let event = self.events.cancel(id).await?;
        self.remove_units(&event).await?;
        log_event_operation("cancel_event", &event.id, Some(&event.project_id), "CANCELED");
        Ok(event)
    }

    #[instrument(skip(self))]
    pub async fn cancel_many(&self, selector: &EventsSelector) -> Result<Vec<Event>> {
        let canceled = self.events.cancel_many(selector).await?;
        info!(count = canceled.len(), "Canceled events");
        self.remove_units_later(&canceled);
        Ok(canceled)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<Event> {
        let event = self.events.delete(id).await?;
        self.remove_units(&event).await?;
        log_event_operation("delete_event", &event.id, Some(&event.project_id), "DELETED");
        Ok(event)
    }

    #[instrument(skip(self))]
    pub async fn delete_many(&self, selector: &EventsSelector) -> Result<Vec<Event>> {
        let deleted = self.events.delete_many(selector).await?;
        info!(count = deleted.len(), "Deleted events");
        self.remove_units_later(&deleted);
        Ok(deleted)
    }

    pub async fn get_logs(&self, event_id: &str, selector: &LogsSelector) -> Result<Vec<LogEntry>> {
        self.logs.get_logs(event_id, selector).await
    }

    pub async fn stream_logs(
        &self,
        event_id: &str,
        selector: &LogsSelector,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<LogEntry>> {
        self.logs.stream_logs(event_id, selector, cancel).await
    }

    fn namespace_of<'a>(&'a self, event: &'a Event) -> &'a str {
        if event.namespace.is_empty() {
            &self.default_namespace
        } else {
            &event.namespace
        }
    }

    async fn remove_units(&self, event: &Event) -> Result<()> {
        let removed = self
            .substrate
            .delete_units(Some(self.namespace_of(event)), &LabelSelector::event(&event.id))
            .await?;
        debug!(event_id = %event.id, removed, "Removed event units");
        Ok(())
    }

    fn remove_units_later(&self, events: &[Event]) {
        for event in events {
            let substrate = Arc::clone(&self.substrate);
            let namespace = self.namespace_of(event).to_string();
            let selector = LabelSelector::event(&event.id);
            self.background.spawn("remove_event_units", async move {
                substrate.delete_units(Some(&namespace), &selector).await?;
                Ok(())
            });
        }
    }
}
