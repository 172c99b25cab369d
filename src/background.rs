//! # Background Tasks
//!
//! Bounded set of detached async operations: reconciler status writes,
//! deferred unit deletions and bulk substrate cleanup. Callers never wait on
//! these, but they stay observable (counters) and can be drained or aborted
//! on shutdown instead of leaking as bare `tokio::spawn`s.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::Result;

#[derive(Debug, Default)]
struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of a [`BackgroundTasks`] set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackgroundStats {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
}

impl BackgroundStats {
    pub fn in_flight(&self) -> u64 {
        self.spawned - self.completed - self.failed
    }
}

#[derive(Debug)]
pub struct BackgroundTasks {
    name: String,
    tasks: Mutex<JoinSet<()>>,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl BackgroundTasks {
    /// `max_concurrency` bounds how many of the operations run at once;
    /// the rest wait for a permit.
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            tasks: Mutex::new(JoinSet::new()),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Runs `operation` in the background. Failures are logged under
    /// `label` and counted; they never reach the caller.
    pub fn spawn<F>(&self, label: &'static str, operation: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_after(label, Duration::ZERO, operation);
    }

    /// Like [`spawn`](Self::spawn), but waits `delay` first. The wait does
    /// not hold a concurrency permit.
    pub fn spawn_after<F>(&self, label: &'static str, delay: Duration, operation: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let counters = Arc::clone(&self.counters);
        let set_name = self.name.clone();
        counters.spawned.fetch_add(1, Ordering::SeqCst);

        let mut tasks = self.tasks.lock();
        // Reap whatever already finished so the set stays bounded.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(set = %set_name, operation = label, "Background set closed, dropping operation");
                counters.failed.fetch_add(1, Ordering::SeqCst);
                return;
            };
            match operation.await {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    error!(set = %set_name, operation = label, error = %e, "Background operation failed");
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }

    pub fn stats(&self) -> BackgroundStats {
        BackgroundStats {
            spawned: self.counters.spawned.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Waits until every operation spawned so far, and any spawned while
    /// draining, has finished.
    pub async fn drain(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.tasks.lock());
            if pending.is_empty() {
                return;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(set = %self.name, "Background operation panicked: {}", e);
                        self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }
    }

    /// Aborts everything still pending. Used on shutdown.
    pub fn abort_all(&self) {
        let mut tasks = self.tasks.lock();
        debug!(set = %self.name, pending = tasks.len(), "Aborting background operations");
        tasks.abort_all();
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
    }
}
