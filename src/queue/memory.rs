//! In-process task queue.
//!
//! Pending tasks sit in an ordered map keyed by the instant they become
//! visible, so delayed tasks surface in due-time order. Claimed tasks are
//! tracked per consumer until acknowledged, retried or reclaimed. Visibility
//! uses `tokio::time::Instant`, which lets tests drive delays with a paused
//! clock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{Task, TaskEnvelope, TaskQueue};
use crate::error::Result;

#[derive(Debug, Default)]
struct Inner {
    sequence: u64,
    pending: BTreeMap<(Instant, u64), TaskEnvelope>,
    claimed: HashMap<Uuid, (String, TaskEnvelope)>,
    submitted: Vec<Task>,
}

impl Inner {
    fn enqueue(&mut self, envelope: TaskEnvelope, visible_at: Instant) {
        self.sequence += 1;
        self.pending.insert((visible_at, self.sequence), envelope);
    }
}

#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
    inner: Mutex<Inner>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every task ever submitted, in submission order.
    pub fn submitted(&self) -> Vec<Task> {
        self.inner.lock().submitted.clone()
    }

    /// Tasks not yet claimed, with the time left until each is visible.
    pub fn pending(&self) -> Vec<(Task, Duration)> {
        let now = Instant::now();
        self.inner
            .lock()
            .pending
            .iter()
            .map(|((at, _), env)| (env.task.clone(), at.saturating_duration_since(now)))
            .collect()
    }

    pub fn claimed_by(&self, consumer_id: &str) -> Vec<TaskEnvelope> {
        self.inner
            .lock()
            .claimed
            .values()
            .filter(|(owner, _)| owner == consumer_id)
            .map(|(_, env)| env.clone())
            .collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn submit(&self, task: Task, delay: Option<Duration>) -> Result<Uuid> {
        let envelope = TaskEnvelope::new(task.clone(), delay);
        let id = envelope.id;
        let visible_at = Instant::now() + delay.unwrap_or_default();
        let mut inner = self.inner.lock();
        inner.submitted.push(task);
        inner.enqueue(envelope, visible_at);
        Ok(id)
    }

    async fn receive(&self, consumer_id: &str) -> Result<Option<TaskEnvelope>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let due = match inner.pending.first_key_value() {
            Some((key, _)) if key.0 <= now => *key,
            _ => return Ok(None),
        };
        let Some(envelope) = inner.pending.remove(&due) else {
            return Ok(None);
        };
        inner
            .claimed
            .insert(envelope.id, (consumer_id.to_string(), envelope.clone()));
        Ok(Some(envelope))
    }

    async fn ack(&self, consumer_id: &str, task_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.claimed.get(&task_id) {
            Some((owner, _)) if owner == consumer_id => {
                inner.claimed.remove(&task_id);
                Ok(true)
            }
            _ => {
                debug!(consumer_id, %task_id, "Ack for a claim no longer held");
                Ok(false)
            }
        }
    }

    async fn retry(&self, consumer_id: &str, task_id: Uuid, delay: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        let owned = matches!(inner.claimed.get(&task_id), Some((owner, _)) if owner == consumer_id);
        if !owned {
            return Ok(false);
        }
        let Some((_, mut envelope)) = inner.claimed.remove(&task_id) else {
            return Ok(false);
        };
        envelope.attempt += 1;
        inner.enqueue(envelope, Instant::now() + delay);
        Ok(true)
    }

    async fn reclaim(&self, consumer_id: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        let ids: Vec<Uuid> = inner
            .claimed
            .iter()
            .filter(|(_, (owner, _))| owner == consumer_id)
            .map(|(id, _)| *id)
            .collect();
        let now = Instant::now();
        for id in &ids {
            if let Some((_, envelope)) = inner.claimed.remove(id) {
                inner.enqueue(envelope, now);
            }
        }
        Ok(ids.len())
    }

    async fn depth(&self) -> Result<usize> {
        let inner = self.inner.lock();
        Ok(inner.pending.len() + inner.claimed.len())
    }
}
