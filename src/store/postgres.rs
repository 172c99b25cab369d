//! # PostgreSQL Status Store
//!
//! Events and Projects are stored as JSONB documents, one row each. Every
//! conditional write runs in a transaction that takes the row lock with
//! `SELECT ... FOR UPDATE`, applies the same transition rules as the memory
//! store, and writes the document back only when something changed.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use std::collections::BTreeMap;
use tracing::{debug, error, instrument};

use super::{
    apply_cancellation, apply_fan_out, apply_job_status, apply_worker_status, EventStore,
    EventsSelector, ProjectStore,
};
use crate::error::{EventflowError, Result};
use crate::models::{Event, EventStatus, JobStatus, Project, Worker, WorkerStatus};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Locks one Event row, hands the decoded document to `mutate`, and
    /// writes it back when `mutate` reports a change.
    async fn mutate_event<T, F>(&self, id: &str, operation: &str, mutate: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut Event) -> Result<(T, bool)> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EventflowError::database(operation, e))?;

        let row: Option<(Json<Event>,)> =
            sqlx::query_as("SELECT document FROM eventflow_events WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| {
                    error!(event_id = %id, "Failed to lock event for {}: {}", operation, e);
                    EventflowError::database(operation, e)
                })?;
        let Some((Json(mut event),)) = row else {
            return Err(EventflowError::not_found("Event", id));
        };

        let (value, dirty) = mutate(&mut event)?;
        if dirty {
            write_event(&mut *tx, &event, operation).await?;
        }
        tx.commit()
            .await
            .map_err(|e| EventflowError::database(operation, e))?;
        Ok(value)
    }

    async fn select_events(
        conn: &mut PgConnection,
        project_id: &str,
        lock: bool,
        operation: &str,
    ) -> Result<Vec<Event>> {
        let query = if lock {
            "SELECT document FROM eventflow_events WHERE project_id = $1 FOR UPDATE"
        } else {
            "SELECT document FROM eventflow_events WHERE ($1 = '' OR project_id = $1) \
             ORDER BY created_at DESC, id"
        };
        let rows: Vec<(Json<Event>,)> = sqlx::query_as(query)
            .bind(project_id)
            .fetch_all(conn)
            .await
            .map_err(|e| EventflowError::database(operation, e))?;
        Ok(rows.into_iter().map(|(Json(event),)| event).collect())
    }
}

async fn write_event(conn: &mut PgConnection, event: &Event, operation: &str) -> Result<()> {
    sqlx::query(
        "UPDATE eventflow_events SET document = $2, status = $3, updated_at = now() WHERE id = $1",
    )
    .bind(&event.id)
    .bind(Json(event))
    .bind(event.status.as_str())
    .execute(conn)
    .await
    .map_err(|e| {
        error!(event_id = %event.id, "Failed to write event for {}: {}", operation, e);
        EventflowError::database(operation, e)
    })?;
    Ok(())
}

#[async_trait]
impl EventStore for PgStore {
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    async fn create(&self, event: &Event) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO eventflow_events (id, project_id, status, document, created_at) \
             VALUES ($1, $2, $3, $4, COALESCE($5, now())) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&event.id)
        .bind(&event.project_id)
        .bind(event.status.as_str())
        .bind(Json(event))
        .bind(event.created)
        .execute(&self.pool)
        .await
        .map_err(|e| EventflowError::database("create_event", e))?;

        if result.rows_affected() == 0 {
            return Err(EventflowError::conflict(
                "Event",
                &event.id,
                "an event with this id already exists",
            ));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Event> {
        let row: Option<(Json<Event>,)> =
            sqlx::query_as("SELECT document FROM eventflow_events WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| EventflowError::database("get_event", e))?;
        row.map(|(Json(event),)| event)
            .ok_or_else(|| EventflowError::not_found("Event", id))
    }

    async fn list(&self, selector: &EventsSelector) -> Result<Vec<Event>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| EventflowError::database("list_events", e))?;
        let events = Self::select_events(&mut *conn, &selector.project_id, false, "list_events")
            .await?
            .into_iter()
            .filter(|e| selector.matches(e))
            .collect();
        Ok(events)
    }

    #[instrument(skip(self, workers), fields(worker_count = workers.len()))]
    async fn update_workers_and_status(
        &self,
        id: &str,
        workers: &BTreeMap<String, Worker>,
        status: EventStatus,
    ) -> Result<bool> {
        self.mutate_event(id, "update_workers_and_status", |event| {
            let applied = apply_fan_out(event, workers, status);
            Ok((applied, applied))
        })
        .await
    }

    async fn update_worker_status(
        &self,
        id: &str,
        worker_name: &str,
        status: &WorkerStatus,
    ) -> Result<bool> {
        self.mutate_event(id, "update_worker_status", |event| {
            let applied = apply_worker_status(event, worker_name, status)?;
            Ok((applied, applied))
        })
        .await
    }

    async fn update_job_status(
        &self,
        id: &str,
        worker_name: &str,
        job_name: &str,
        status: &JobStatus,
    ) -> Result<bool> {
        self.mutate_event(id, "update_job_status", |event| {
            let applied = apply_job_status(event, worker_name, job_name, status)?;
            Ok((applied, applied))
        })
        .await
    }

    async fn cancel(&self, id: &str) -> Result<Event> {
        let now = Utc::now();
        self.mutate_event(id, "cancel_event", |event| {
            if !apply_cancellation(event, None, now) {
                return Err(EventflowError::conflict(
                    "Event",
                    &event.id,
                    "event has no pending or running workers left to cancel",
                ));
            }
            Ok((event.clone(), true))
        })
        .await
    }

    #[instrument(skip(self), fields(project_id = %selector.project_id))]
    async fn cancel_many(&self, selector: &EventsSelector) -> Result<Vec<Event>> {
        selector.ensure_qualified("cancel")?;
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EventflowError::database("cancel_events", e))?;

        let mut canceled = Vec::new();
        for mut event in
            Self::select_events(&mut *tx, &selector.project_id, true, "cancel_events").await?
        {
            if apply_cancellation(&mut event, Some(&selector.worker_phases), now) {
                write_event(&mut *tx, &event, "cancel_events").await?;
                canceled.push(event);
            }
        }
        tx.commit()
            .await
            .map_err(|e| EventflowError::database("cancel_events", e))?;

        debug!(count = canceled.len(), "Canceled events");
        Ok(canceled)
    }

    async fn delete(&self, id: &str) -> Result<Event> {
        let row: Option<(Json<Event>,)> =
            sqlx::query_as("DELETE FROM eventflow_events WHERE id = $1 RETURNING document")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| EventflowError::database("delete_event", e))?;
        row.map(|(Json(event),)| event)
            .ok_or_else(|| EventflowError::not_found("Event", id))
    }

    #[instrument(skip(self), fields(project_id = %selector.project_id))]
    async fn delete_many(&self, selector: &EventsSelector) -> Result<Vec<Event>> {
        selector.ensure_qualified("delete")?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EventflowError::database("delete_events", e))?;

        let deleted: Vec<Event> =
            Self::select_events(&mut *tx, &selector.project_id, true, "delete_events")
                .await?
                .into_iter()
                .filter(|e| selector.matches(e))
                .collect();
        let ids: Vec<String> = deleted.iter().map(|e| e.id.clone()).collect();
        if !ids.is_empty() {
            sqlx::query("DELETE FROM eventflow_events WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| EventflowError::database("delete_events", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| EventflowError::database("delete_events", e))?;

        debug!(count = deleted.len(), "Deleted events");
        Ok(deleted)
    }
}

#[async_trait]
impl ProjectStore for PgStore {
    async fn create(&self, project: &Project) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO eventflow_projects (id, document) VALUES ($1, $2) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&project.id)
        .bind(Json(project))
        .execute(&self.pool)
        .await
        .map_err(|e| EventflowError::database("create_project", e))?;

        if result.rows_affected() == 0 {
            return Err(EventflowError::conflict(
                "Project",
                &project.id,
                "a project with this id already exists",
            ));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Project> {
        let row: Option<(Json<Project>,)> =
            sqlx::query_as("SELECT document FROM eventflow_projects WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| EventflowError::database("get_project", e))?;
        row.map(|(Json(project),)| project)
            .ok_or_else(|| EventflowError::not_found("Project", id))
    }

    async fn list_subscribers(&self, event: &Event) -> Result<Vec<Project>> {
        let rows: Vec<(Json<Project>,)> =
            sqlx::query_as("SELECT document FROM eventflow_projects ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| EventflowError::database("list_subscribers", e))?;
        Ok(rows
            .into_iter()
            .map(|(Json(project),)| project)
            .filter(|p| p.is_subscribed_to(event))
            .collect())
    }
}
