//! Log collection on the `eventflow_log_entries` table. The `BIGSERIAL` id
//! gives insertion order; a cursor remembers the last id it returned.
//!
//! Ids are drawn before commit, so two concurrent writers could commit out
//! of id order and a tail reading `id > last` would skip the late row.
//! [`PgLogStore::append`] takes a transaction-scoped advisory lock per
//! `(event, component, container)` stream, which makes ids within a stream
//! commit in order. Cursors only ever read a single stream.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::VecDeque;
use tracing::error;

use super::{LogCursor, LogStore, RawLogDocument};
use crate::error::{EventflowError, Result};
use crate::models::LogCriteria;

const TAIL_BATCH_SIZE: i64 = 100;

#[derive(Debug, Clone)]
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Writes one document the way the log agent does.
    pub async fn append(&self, criteria: &LogCriteria, document: &RawLogDocument) -> Result<i64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EventflowError::database("append_log", e))?;

        // Held until commit; serializes writers of the same stream.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!(
                "{}/{}/{}",
                criteria.event_id, criteria.component, criteria.container
            ))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!(event_id = %criteria.event_id, "Failed to lock log stream: {}", e);
                EventflowError::database("append_log", e)
            })?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO eventflow_log_entries (event_id, component, container, document) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(&criteria.event_id)
        .bind(&criteria.component)
        .bind(&criteria.container)
        .bind(Json(document))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| EventflowError::database("append_log", e))?;

        tx.commit()
            .await
            .map_err(|e| EventflowError::database("append_log", e))?;
        Ok(id)
    }

    async fn fetch_after(
        pool: &PgPool,
        criteria: &LogCriteria,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<(i64, Json<RawLogDocument>)>> {
        sqlx::query_as(
            "SELECT id, document FROM eventflow_log_entries \
             WHERE event_id = $1 AND component = $2 AND container = $3 AND id > $4 \
             ORDER BY id LIMIT $5",
        )
        .bind(&criteria.event_id)
        .bind(&criteria.component)
        .bind(&criteria.container)
        .bind(after_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|e| {
            error!(event_id = %criteria.event_id, "Failed to query log entries: {}", e);
            EventflowError::database("find_logs", e)
        })
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn find(&self, criteria: &LogCriteria) -> Result<Vec<RawLogDocument>> {
        let rows = Self::fetch_after(&self.pool, criteria, 0, i64::MAX).await?;
        Ok(rows.into_iter().map(|(_, Json(doc))| doc).collect())
    }

    async fn tail(&self, criteria: &LogCriteria) -> Result<Box<dyn LogCursor>> {
        let buffered: VecDeque<_> = Self::fetch_after(&self.pool, criteria, 0, TAIL_BATCH_SIZE)
            .await?
            .into_iter()
            .collect();
        Ok(Box::new(PgLogCursor {
            pool: self.pool.clone(),
            criteria: criteria.clone(),
            dead: buffered.is_empty(),
            last_id: 0,
            buffered,
        }))
    }
}

struct PgLogCursor {
    pool: PgPool,
    criteria: LogCriteria,
    dead: bool,
    last_id: i64,
    buffered: VecDeque<(i64, Json<RawLogDocument>)>,
}

#[async_trait]
impl LogCursor for PgLogCursor {
    fn is_dead(&self) -> bool {
        self.dead
    }

    async fn try_next(&mut self) -> Result<Option<RawLogDocument>> {
        if self.dead {
            return Ok(None);
        }
        if self.buffered.is_empty() {
            let rows =
                PgLogStore::fetch_after(&self.pool, &self.criteria, self.last_id, TAIL_BATCH_SIZE)
                    .await?;
            self.buffered.extend(rows);
        }
        Ok(self.buffered.pop_front().map(|(id, Json(doc))| {
            self.last_id = id;
            doc
        }))
    }
}
