//! # Task Consumer
//!
//! Runs N concurrent handler loops against one [`TaskQueue`], plus a
//! heartbeat loop and a dead-consumer cleaner.
//!
//! ## Delivery discipline
//!
//! - Follow-up tasks returned by a handler are submitted *before* the
//!   original task is acknowledged. A crash in between causes a redelivery,
//!   never a lost follow-up.
//! - Retryable (transient) failures go back to the queue with exponential
//!   backoff. Once a task has used up `max_attempts` the consumer stops with
//!   a fatal error.
//! - Anything else (invariant violations, malformed data) is logged, recorded
//!   in [`TaskConsumer::failed_tasks`] and dropped.
//! - Queue calls made while settling a task (submit, ack, retry) get the
//!   same bounded attempts with backoff; only exhaustion is fatal.
//!
//! ## Liveness
//!
//! The first heartbeat is written before any task is received. Later beats
//! run on a fixed interval, each retried with bounded attempts; exhaustion is
//! fatal because peers would otherwise reclaim work this consumer still holds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{Backoff, HeartbeatRegistry, ScheduledTask, Task, TaskEnvelope, TaskQueue};
use crate::config::EventflowConfig;
use crate::error::{EventflowError, Result};

/// Executes one task and returns the follow-ups it wants scheduled.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<Vec<ScheduledTask>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskConsumerConfig {
    pub consumer_id: String,
    pub concurrent_handlers: usize,
    pub max_attempts: u32,
    pub retry_backoff: Backoff,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_max_attempts: u32,
    pub heartbeat_backoff: Backoff,
    pub cleaner_interval: Duration,
    pub dead_consumer_threshold: Duration,
}

impl Default for TaskConsumerConfig {
    fn default() -> Self {
        Self::from_config(&EventflowConfig::default())
    }
}

impl TaskConsumerConfig {
    pub fn from_config(config: &EventflowConfig) -> Self {
        let queue = &config.queue;
        let heartbeat = &config.heartbeat;
        Self {
            consumer_id: queue
                .consumer_id
                .clone()
                .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4())),
            concurrent_handlers: usize::from(queue.concurrent_handlers),
            max_attempts: queue.max_attempts,
            retry_backoff: Backoff::new(
                Duration::from_millis(queue.retry_initial_backoff_ms),
                Duration::from_millis(queue.retry_max_backoff_ms),
            ),
            poll_interval: Duration::from_millis(queue.poll_interval_ms),
            heartbeat_interval: Duration::from_secs(heartbeat.interval_seconds),
            heartbeat_max_attempts: heartbeat.max_attempts,
            heartbeat_backoff: Backoff::new(
                Duration::from_millis(heartbeat.retry_initial_backoff_ms),
                Duration::from_secs(heartbeat.interval_seconds),
            ),
            cleaner_interval: Duration::from_secs(heartbeat.cleaner_interval_seconds),
            dead_consumer_threshold: Duration::from_secs(heartbeat.dead_consumer_threshold_seconds),
        }
    }

    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }
}

/// A task dropped after a non-retryable failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedTask {
    pub task_id: Uuid,
    pub task: Task,
    pub attempt: u32,
    pub error: EventflowError,
    pub failed_at: DateTime<Utc>,
}

pub struct TaskConsumer {
    config: TaskConsumerConfig,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<dyn HeartbeatRegistry>,
    handler: Arc<dyn TaskHandler>,
    failed: Mutex<Vec<FailedTask>>,
    processed: AtomicU64,
}

impl std::fmt::Debug for TaskConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskConsumer")
            .field("config", &self.config)
            .field("processed", &self.processed.load(Ordering::SeqCst))
            .finish()
    }
}

impl TaskConsumer {
    pub fn new(
        config: TaskConsumerConfig,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<dyn HeartbeatRegistry>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            config,
            queue,
            registry,
            handler,
            failed: Mutex::new(Vec::new()),
            processed: AtomicU64::new(0),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.config.consumer_id
    }

    pub fn failed_tasks(&self) -> Vec<FailedTask> {
        self.failed.lock().clone()
    }

    /// Tasks handled successfully and acknowledged.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Runs until `shutdown` fires (returns `Ok`) or a fatal error occurs
    /// (returns that error after stopping every loop).
    #[instrument(skip_all, fields(consumer_id = %self.config.consumer_id))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.beat().await?;
        info!(
            handlers = self.config.concurrent_handlers,
            "🚀 Task consumer started"
        );

        let stop = shutdown.child_token();
        let mut loops: JoinSet<Result<()>> = JoinSet::new();
        loops.spawn(Arc::clone(&self).heartbeat_loop(stop.clone()));
        loops.spawn(Arc::clone(&self).cleaner_loop(stop.clone()));
        for index in 0..self.config.concurrent_handlers.max(1) {
            loops.spawn(Arc::clone(&self).handler_loop(index, stop.clone()));
        }

        let mut outcome = Ok(());
        while let Some(joined) = loops.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(EventflowError::Internal(format!("consumer loop panicked: {e}")))
            });
            if let Err(e) = result {
                error!(error = %e, "💥 Fatal task consumer error, stopping");
                stop.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        if outcome.is_ok() {
            if let Err(e) = self.registry.remove(&self.config.consumer_id).await {
                warn!(error = %e, "Failed to deregister consumer heartbeat");
            }
            info!(processed = self.processed_count(), "🛑 Task consumer stopped");
        }
        outcome
    }

    /// One heartbeat with bounded retries.
    async fn beat(&self) -> Result<()> {
        let max_attempts = self.config.heartbeat_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.registry.beat(&self.config.consumer_id, Utc::now()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= max_attempts => {
                    return Err(EventflowError::Heartbeat {
                        consumer_id: self.config.consumer_id.clone(),
                        reason: format!("gave up after {attempt} attempts: {e}"),
                    });
                }
                Err(e) => {
                    let delay = self.config.heartbeat_backoff.delay(attempt);
                    warn!(attempt, ?delay, error = %e, "Heartbeat failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The immediate first tick is covered by the synchronous beat in run().
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => self.beat().await?,
            }
        }
    }

    async fn cleaner_loop(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.cleaner_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.reclaim_dead_consumers().await {
                        warn!(error = %e, "Dead consumer cleanup failed");
                    }
                }
            }
        }
    }

    /// Returns in-flight tasks of consumers whose last heartbeat is older
    /// than the dead-consumer threshold, and forgets those consumers.
    pub async fn reclaim_dead_consumers(&self) -> Result<usize> {
        let threshold = chrono::Duration::from_std(self.config.dead_consumer_threshold)
            .map_err(|e| EventflowError::Configuration(e.to_string()))?;
        let cutoff = Utc::now() - threshold;

        let mut reclaimed = 0;
        for dead in self.registry.dead_since(cutoff).await? {
            if dead == self.config.consumer_id {
                continue;
            }
            let released = self.queue.reclaim(&dead).await?;
            self.registry.remove(&dead).await?;
            info!(dead_consumer = %dead, released, "♻️ Reclaimed work from dead consumer");
            reclaimed += released;
        }
        Ok(reclaimed)
    }

    async fn handler_loop(self: Arc<Self>, index: usize, stop: CancellationToken) -> Result<()> {
        debug!(handler = index, "Handler loop started");
        loop {
            let received = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                received = self.queue.receive(&self.config.consumer_id) => received,
            };
            match received {
                Ok(Some(envelope)) => self.process(envelope).await?,
                Ok(None) => {
                    tokio::select! {
                        _ = stop.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(handler = index, error = %e, "Failed to receive task");
                    tokio::select! {
                        _ = stop.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Runs one queue call with bounded attempts. Non-transient errors are
    /// returned at once.
    async fn with_queue_retries<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(EventflowError::queue(
                        operation,
                        format!("gave up after {attempt} attempts: {e}"),
                    ));
                }
                Err(e) => {
                    let delay = self.config.retry_backoff.delay(attempt);
                    warn!(operation, attempt, ?delay, error = %e, "Queue call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn submit_follow_ups(&self, follow_ups: Vec<ScheduledTask>) -> Result<()> {
        for follow_up in follow_ups {
            self.with_queue_retries("submit", || {
                self.queue.submit(follow_up.task.clone(), follow_up.delay)
            })
            .await?;
        }
        Ok(())
    }

    async fn ack(&self, task_id: Uuid) -> Result<bool> {
        self.with_queue_retries("ack", || self.queue.ack(&self.config.consumer_id, task_id))
            .await
    }

    async fn release(&self, task_id: Uuid, delay: Duration) -> Result<bool> {
        self.with_queue_retries("retry", || {
            self.queue.retry(&self.config.consumer_id, task_id, delay)
        })
        .await
    }

    /// Handles one delivery. Only a fatal condition is returned as `Err`.
    #[instrument(skip(self, envelope), fields(task_id = %envelope.id, task = %envelope.task, attempt = envelope.attempt))]
    async fn process(&self, envelope: TaskEnvelope) -> Result<()> {
        let outcome = match self.handler.handle(&envelope.task).await {
            Ok(follow_ups) => self.submit_follow_ups(follow_ups).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.ack(envelope.id).await?;
                self.processed.fetch_add(1, Ordering::SeqCst);
                debug!("✅ Task completed");
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                let executions = envelope.attempt + 1;
                let delay = self.config.retry_backoff.delay(executions);
                if executions >= self.config.max_attempts {
                    error!(error = %e, executions, "Task exhausted its attempts");
                    // Leave the task for a healthy consumer.
                    if let Err(release) = self.release(envelope.id, delay).await {
                        warn!(error = %release, "Failed to release exhausted task");
                    }
                    return Err(EventflowError::queue(
                        "handle",
                        format!("{} failed {executions} times: {e}", envelope.task),
                    ));
                }
                warn!(error = %e, ?delay, "Task failed, retrying with backoff");
                self.release(envelope.id, delay).await?;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, kind = ?e.kind(), "Task failed permanently, dropping");
                self.failed.lock().push(FailedTask {
                    task_id: envelope.id,
                    task: envelope.task.clone(),
                    attempt: envelope.attempt,
                    error: e,
                    failed_at: Utc::now(),
                });
                self.ack(envelope.id).await?;
                Ok(())
            }
        }
    }
}
