//! # PostgreSQL Task Queue
//!
//! Durable queue on the `eventflow_tasks` table. Claiming follows the same
//! pattern as distributed task claiming elsewhere in this codebase: the next
//! visible, unclaimed row is picked with `FOR UPDATE SKIP LOCKED` so that
//! concurrent consumers never block on or double-claim one another's rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::{Task, TaskEnvelope, TaskQueue};
use crate::error::{EventflowError, Result};

#[derive(Debug, sqlx::FromRow)]
struct ClaimedTaskRow {
    id: Uuid,
    payload: Json<Task>,
    attempt: i32,
    visible_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    #[instrument(skip(self), fields(kind = task.kind()))]
    async fn submit(&self, task: Task, delay: Option<Duration>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO eventflow_tasks (id, kind, payload, visible_at) \
             VALUES ($1, $2, $3, now() + ($4::bigint * interval '1 millisecond'))",
        )
        .bind(id)
        .bind(task.kind())
        .bind(Json(&task))
        .bind(millis(delay.unwrap_or_default()))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to submit task {}: {}", task, e);
            EventflowError::queue("submit", e)
        })?;
        debug!(task_id = %id, "📤 Submitted task {}", task);
        Ok(id)
    }

    async fn receive(&self, consumer_id: &str) -> Result<Option<TaskEnvelope>> {
        let query = r#"
            UPDATE eventflow_tasks
            SET claimed_by = $1, claimed_at = now()
            WHERE id = (
                SELECT id FROM eventflow_tasks
                WHERE claimed_by IS NULL AND visible_at <= now()
                ORDER BY visible_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, payload, attempt, visible_at
        "#;
        let row = sqlx::query_as::<_, ClaimedTaskRow>(query)
            .bind(consumer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EventflowError::queue("receive", e))?;

        Ok(row.map(|row| TaskEnvelope {
            id: row.id,
            task: row.payload.0,
            attempt: u32::try_from(row.attempt).unwrap_or(0),
            not_before: row.visible_at,
        }))
    }

    async fn ack(&self, consumer_id: &str, task_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM eventflow_tasks WHERE id = $1 AND claimed_by = $2")
            .bind(task_id)
            .bind(consumer_id)
            .execute(&self.pool)
            .await
            .map_err(|e| EventflowError::queue("ack", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn retry(&self, consumer_id: &str, task_id: Uuid, delay: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE eventflow_tasks \
             SET claimed_by = NULL, claimed_at = NULL, attempt = attempt + 1, \
                 visible_at = now() + ($3::bigint * interval '1 millisecond') \
             WHERE id = $1 AND claimed_by = $2",
        )
        .bind(task_id)
        .bind(consumer_id)
        .bind(millis(delay))
        .execute(&self.pool)
        .await
        .map_err(|e| EventflowError::queue("retry", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn reclaim(&self, consumer_id: &str) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE eventflow_tasks SET claimed_by = NULL, claimed_at = NULL \
             WHERE claimed_by = $1",
        )
        .bind(consumer_id)
        .execute(&self.pool)
        .await
        .map_err(|e| EventflowError::queue("reclaim", e))?;

        let released = usize::try_from(result.rows_affected()).unwrap_or(usize::MAX);
        if released > 0 {
            info!(consumer_id, released, "♻️ Reclaimed in-flight tasks");
        }
        Ok(released)
    }

    async fn depth(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM eventflow_tasks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EventflowError::queue("depth", e))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
