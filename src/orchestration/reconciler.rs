//! # Pod Reconciler
//!
//! Follows execution units on the substrate and mirrors their phase into
//! Worker and Job status. One list-then-watch loop runs per unit category;
//! neither goes through the task queue.
//!
//! ## Phase mapping
//!
//! | Unit phase            | Domain phase |
//! |-----------------------|--------------|
//! | `Pending`, `Running`  | RUNNING      |
//! | `Succeeded`           | SUCCEEDED    |
//! | `Failed`              | FAILED       |
//! | `Unknown`             | UNKNOWN      |
//!
//! A Job unit whose primary container has terminated is SUCCEEDED or FAILED
//! by that container's outcome, even while sidecars keep the unit running.
//!
//! ## Bookkeeping
//!
//! Each category owns a [`UnitTracker`]: the units occupying capacity and the
//! units with a deletion already scheduled. Only watch callbacks touch them.
//! Both are rebuilt by the next list-then-watch pass and can be discarded on
//! restart.
//!
//! Status writes and deferred deletions go to a bounded [`BackgroundTasks`]
//! set so the watch loop never waits on them. Write failures are logged and
//! not retried; the next observation of the unit writes again.

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::background::BackgroundTasks;
use crate::config::ReconcilerConfig;
use crate::constants::labels;
use crate::error::{EventflowError, Result};
use crate::logging::log_unit_operation;
use crate::models::{WorkerPhase, WorkerStatus};
use crate::store::EventStore;
use crate::substrate::{ExecutionSubstrate, LabelSelector, Unit, UnitPhase, WatchEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitCategory {
    Worker,
    Job,
}

impl UnitCategory {
    pub fn selector(self) -> LabelSelector {
        match self {
            UnitCategory::Worker => LabelSelector::worker_units(),
            UnitCategory::Job => LabelSelector::job_units(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitCategory::Worker => "worker",
            UnitCategory::Job => "job",
        }
    }
}

impl fmt::Display for UnitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain phase for a unit observation.
pub fn domain_phase(category: UnitCategory, unit: &Unit) -> WorkerPhase {
    if category == UnitCategory::Job {
        if let Some(termination) = &unit.primary_termination {
            return if termination.succeeded {
                WorkerPhase::Succeeded
            } else {
                WorkerPhase::Failed
            };
        }
    }
    match unit.phase {
        UnitPhase::Pending | UnitPhase::Running => WorkerPhase::Running,
        UnitPhase::Succeeded => WorkerPhase::Succeeded,
        UnitPhase::Failed => WorkerPhase::Failed,
        UnitPhase::Unknown => WorkerPhase::Unknown,
    }
}

fn observed_status(category: UnitCategory, unit: &Unit) -> WorkerStatus {
    WorkerStatus {
        phase: domain_phase(category, unit),
        started: unit.started,
        ended: unit
            .primary_termination
            .as_ref()
            .and_then(|termination| termination.finished_at),
    }
}

/// Capacity and pending-deletion sets for one unit category, keyed by
/// namespaced unit name. Each set has its own lock.
#[derive(Debug, Default)]
pub struct UnitTracker {
    capacity: Mutex<HashSet<String>>,
    deleting: Mutex<HashSet<String>>,
}

impl UnitTracker {
    pub fn occupies_capacity(&self, key: &str) -> bool {
        self.capacity.lock().contains(key)
    }

    pub fn capacity_count(&self) -> usize {
        self.capacity.lock().len()
    }

    pub fn is_pending_deletion(&self, key: &str) -> bool {
        self.deleting.lock().contains(key)
    }

    pub fn pending_deletion_count(&self) -> usize {
        self.deleting.lock().len()
    }

    fn occupy(&self, key: &str) {
        self.capacity.lock().insert(key.to_string());
    }

    fn release(&self, key: &str) {
        self.capacity.lock().remove(key);
    }

    /// `true` only for the first caller per key.
    fn schedule_deletion(&self, key: &str) -> bool {
        self.deleting.lock().insert(key.to_string())
    }

    fn confirm_deleted(&self, key: &str) {
        self.capacity.lock().remove(key);
        self.deleting.lock().remove(key);
    }

    /// Drops entries for units that no longer exist after a full listing.
    fn retain_listed(&self, listed: &HashSet<String>) {
        self.capacity.lock().retain(|key| listed.contains(key));
        self.deleting.lock().retain(|key| listed.contains(key));
    }
}

pub struct PodReconciler {
    events: Arc<dyn EventStore>,
    substrate: Arc<dyn ExecutionSubstrate>,
    background: Arc<BackgroundTasks>,
    config: ReconcilerConfig,
    /// Restricts list and delete calls to one namespace when set.
    namespace: Option<String>,
    workers: UnitTracker,
    jobs: UnitTracker,
}

impl fmt::Debug for PodReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PodReconciler")
            .field("config", &self.config)
            .field("namespace", &self.namespace)
            .field("workers", &self.workers)
            .field("jobs", &self.jobs)
            .finish()
    }
}

impl PodReconciler {
    pub fn new(
        events: Arc<dyn EventStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        background: Arc<BackgroundTasks>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            events,
            substrate,
            background,
            config,
            namespace: None,
            workers: UnitTracker::default(),
            jobs: UnitTracker::default(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn tracker(&self, category: UnitCategory) -> &UnitTracker {
        match category {
            UnitCategory::Worker => &self.workers,
            UnitCategory::Job => &self.jobs,
        }
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    /// Runs both category loops until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(namespace = ?self.namespace, "🔭 Pod reconciler started");
        let mut loops = JoinSet::new();
        for category in [UnitCategory::Worker, UnitCategory::Job] {
            loops.spawn(Arc::clone(&self).watch_loop(category, shutdown.clone()));
        }
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!("Reconciler loop panicked: {}", e);
                shutdown.cancel();
            }
        }
        info!("🛑 Pod reconciler stopped");
        Ok(())
    }

    /// List-then-watch for one category, re-established whenever the watch
    /// ends or fails.
    async fn watch_loop(self: Arc<Self>, category: UnitCategory, shutdown: CancellationToken) {
        let selector = category.selector();
        while !shutdown.is_cancelled() {
            match self.sync(category, &selector).await {
                Ok(mut watch) => loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        next = watch.next() => next,
                    };
                    match next {
                        Some(event) => self.handle_watch_event(category, event),
                        None => {
                            warn!(%category, "Unit watch ended, resyncing");
                            break;
                        }
                    }
                },
                Err(e) => warn!(%category, error = %e, "Unit resync failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.rewatch_delay()) => {}
            }
        }
    }

    /// Subscribes first, then replays the full listing so no change between
    /// the two is lost.
    async fn sync(
        &self,
        category: UnitCategory,
        selector: &LabelSelector,
    ) -> Result<futures::stream::BoxStream<'static, WatchEvent>> {
        let watch = self.substrate.watch_units(selector).await?;
        let units = self
            .substrate
            .list_units(self.namespace.as_deref(), selector)
            .await?;

        let listed: HashSet<String> = units.iter().map(Unit::namespaced_name).collect();
        self.tracker(category).retain_listed(&listed);
        debug!(%category, units = units.len(), "Resynced units");
        for unit in units {
            self.handle_watch_event(category, WatchEvent::Applied(unit));
        }
        Ok(watch)
    }

    /// Watch callback. Never blocks: status writes and deletions are handed
    /// to the background set with owned copies of everything they need.
    pub fn handle_watch_event(&self, category: UnitCategory, event: WatchEvent) {
        match event {
            WatchEvent::Applied(unit) => self.observe(category, &unit),
            WatchEvent::Deleted(unit) => {
                let key = unit.namespaced_name();
                self.tracker(category).confirm_deleted(&key);
                debug!(%category, unit = %key, "Unit deletion confirmed");
            }
        }
    }

    #[instrument(skip(self, unit), fields(unit = %unit.name, phase = ?unit.phase))]
    fn observe(&self, category: UnitCategory, unit: &Unit) {
        let key = unit.namespaced_name();
        let tracker = self.tracker(category);

        if unit.deletion_requested {
            tracker.release(&key);
            return;
        }

        let status = observed_status(category, unit);
        if status.phase.is_terminal() {
            tracker.release(&key);
        } else {
            tracker.occupy(&key);
        }

        self.write_status(category, unit, status.clone());

        if matches!(status.phase, WorkerPhase::Succeeded | WorkerPhase::Failed)
            && tracker.schedule_deletion(&key)
        {
            self.schedule_deletion(unit);
        }
    }

    fn write_status(&self, category: UnitCategory, unit: &Unit, status: WorkerStatus) {
        let (Some(event_id), Some(worker_name)) =
            (unit.label(labels::EVENT), unit.label(labels::WORKER))
        else {
            warn!(unit = %unit.name, "Unit lacks event or worker label, skipping status update");
            return;
        };
        let job_name = match category {
            UnitCategory::Worker => None,
            UnitCategory::Job => match unit.label(labels::JOB) {
                Some(job) => Some(job.to_string()),
                None => {
                    warn!(unit = %unit.name, "Job unit lacks job label, skipping status update");
                    return;
                }
            },
        };

        let events = Arc::clone(&self.events);
        let event_id = event_id.to_string();
        let worker_name = worker_name.to_string();
        let timeout = self.config.status_write_timeout();

        self.background.spawn("status_write", async move {
            let write = async {
                match &job_name {
                    None => events.update_worker_status(&event_id, &worker_name, &status).await,
                    Some(job) => {
                        events
                            .update_job_status(&event_id, &worker_name, job, &status)
                            .await
                    }
                }
            };
            match tokio::time::timeout(timeout, write).await {
                Ok(Ok(true)) => {
                    debug!(event_id = %event_id, worker = %worker_name, job = ?job_name, phase = %status.phase, "Status recorded");
                    Ok(())
                }
                Ok(Ok(false)) => Ok(()),
                Ok(Err(e)) if e.is_not_found() => {
                    debug!(event_id = %event_id, worker = %worker_name, job = ?job_name, "Status target gone, skipping");
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(EventflowError::database(
                    "status_write",
                    format!("timed out after {timeout:?}"),
                )),
            }
        });
    }

    fn schedule_deletion(&self, unit: &Unit) {
        let substrate = Arc::clone(&self.substrate);
        let namespace = unit.namespace.clone();
        let name = unit.name.clone();
        let grace = self.config.deletion_grace();
        log_unit_operation(
            "schedule_deletion",
            &namespace,
            &name,
            Some(&format!("after {grace:?}")),
        );

        self.background.spawn_after("delete_unit", grace, async move {
            match substrate.delete_unit(&namespace, &name).await {
                Ok(()) => {
                    log_unit_operation("delete_unit", &namespace, &name, None);
                    Ok(())
                }
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            }
        });
    }

    /// Time a finished unit stays around before removal.
    pub fn deletion_grace(&self) -> Duration {
        self.config.deletion_grace()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, EventStatus, Job, JobSpec, Worker, WorkerSpec};
    use crate::store::MemoryStore;
    use crate::substrate::{ContainerTermination, MemorySubstrate, UnitRequest};
    use chrono::Utc;

    struct Fixture {
        reconciler: Arc<PodReconciler>,
        store: Arc<MemoryStore>,
        substrate: Arc<MemorySubstrate>,
    }

    async fn fixture() -> Fixture {
        fixture_with(MemorySubstrate::new()).await
    }

    async fn fixture_with(substrate: MemorySubstrate) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut event = Event::new("github", "push").with_project("p1");
        event.id = "e1".into();
        event.namespace = "ns".into();
        event.status = EventStatus::Processing;
        let mut worker = Worker::new(WorkerSpec::default());
        worker.status = WorkerStatus::with_phase(WorkerPhase::Running);
        worker
            .jobs
            .insert("build".into(), Job::new(JobSpec::default()));
        event.workers.insert("default".into(), worker);
        EventStore::create(store.as_ref(), &event).await.unwrap();

        let substrate = Arc::new(substrate);
        let reconciler = Arc::new(PodReconciler::new(
            store.clone(),
            substrate.clone(),
            Arc::new(BackgroundTasks::new("reconciler", 8)),
            ReconcilerConfig::default(),
        ));
        Fixture {
            reconciler,
            store,
            substrate,
        }
    }

    fn unit(phase: UnitPhase) -> Unit {
        let request = UnitRequest::worker("ns", "p1", "e1", "default", WorkerSpec::default());
        Unit {
            name: request.name,
            namespace: request.namespace,
            labels: request.labels,
            phase,
            started: None,
            primary_termination: None,
            deletion_requested: false,
        }
    }

    #[test]
    fn test_phase_mapping() {
        use UnitPhase::*;
        assert_eq!(domain_phase(UnitCategory::Worker, &unit(Pending)), WorkerPhase::Running);
        assert_eq!(domain_phase(UnitCategory::Worker, &unit(Running)), WorkerPhase::Running);
        assert_eq!(domain_phase(UnitCategory::Worker, &unit(Succeeded)), WorkerPhase::Succeeded);
        assert_eq!(domain_phase(UnitCategory::Worker, &unit(Failed)), WorkerPhase::Failed);
        assert_eq!(domain_phase(UnitCategory::Worker, &unit(Unknown)), WorkerPhase::Unknown);

        let mut job = unit(Running);
        job.primary_termination = Some(ContainerTermination {
            succeeded: false,
            finished_at: Some(Utc::now()),
        });
        assert_eq!(domain_phase(UnitCategory::Job, &job), WorkerPhase::Failed);
        assert_eq!(domain_phase(UnitCategory::Worker, &job), WorkerPhase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_terminal_observations_delete_once() {
        let f = fixture().await;
        f.substrate
            .create_unit(UnitRequest::worker("ns", "p1", "e1", "default", WorkerSpec::default()))
            .await
            .unwrap();
        let finished = f
            .substrate
            .finish("ns", "e1-default", true, Utc::now())
            .unwrap();

        f.reconciler
            .handle_watch_event(UnitCategory::Worker, WatchEvent::Applied(finished.clone()));
        f.reconciler
            .handle_watch_event(UnitCategory::Worker, WatchEvent::Applied(finished));

        let tracker = f.reconciler.tracker(UnitCategory::Worker);
        assert!(tracker.is_pending_deletion("ns:e1-default"));
        assert!(!tracker.occupies_capacity("ns:e1-default"));

        // Still present just before the grace period runs out.
        tokio::time::sleep(f.reconciler.deletion_grace() - Duration::from_secs(1)).await;
        assert!(f.substrate.unit("ns", "e1-default").is_some());
        assert_eq!(f.substrate.deletion_count("ns", "e1-default"), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        f.reconciler.background().drain().await;
        assert_eq!(f.substrate.deletion_count("ns", "e1-default"), 1);
        assert!(f.substrate.unit("ns", "e1-default").is_none());

        let event = EventStore::get(f.store.as_ref(), "e1").await.unwrap();
        assert_eq!(event.workers["default"].phase(), WorkerPhase::Succeeded);

        let mut deleted = unit(UnitPhase::Succeeded);
        deleted.deletion_requested = true;
        f.reconciler
            .handle_watch_event(UnitCategory::Worker, WatchEvent::Deleted(deleted));
        assert_eq!(tracker.pending_deletion_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagged_watch_resyncs_and_records_terminal_status() {
        let f = fixture_with(MemorySubstrate::with_watch_capacity(2)).await;
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(Arc::clone(&f.reconciler).run(shutdown.clone()));
        // Let both loops subscribe and finish their first listing.
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Nothing yields in between, so the watch falls behind.
        f.substrate
            .create_unit(UnitRequest::worker("ns", "p1", "e1", "default", WorkerSpec::default()))
            .await
            .unwrap();
        for i in 2..8 {
            f.substrate
                .create_unit(UnitRequest::worker("ns", "p1", &format!("e{i}"), "default", WorkerSpec::default()))
                .await
                .unwrap();
        }
        f.substrate
            .finish("ns", "e1-default", true, Utc::now())
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let event = EventStore::get(f.store.as_ref(), "e1").await.unwrap();
            if event.workers["default"].phase() == WorkerPhase::Succeeded {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "terminal status never recorded");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(f
            .reconciler
            .tracker(UnitCategory::Worker)
            .is_pending_deletion("ns:e1-default"));

        shutdown.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_deletion_marked_units_skip_status_sync() {
        let f = fixture().await;
        let mut running = unit(UnitPhase::Running);
        f.reconciler
            .handle_watch_event(UnitCategory::Worker, WatchEvent::Applied(running.clone()));
        assert!(f
            .reconciler
            .tracker(UnitCategory::Worker)
            .occupies_capacity("ns:e1-default"));

        running.phase = UnitPhase::Failed;
        running.deletion_requested = true;
        f.reconciler
            .handle_watch_event(UnitCategory::Worker, WatchEvent::Applied(running.clone()));
        f.reconciler.background().drain().await;

        let tracker = f.reconciler.tracker(UnitCategory::Worker);
        assert!(!tracker.occupies_capacity("ns:e1-default"));
        assert!(!tracker.is_pending_deletion("ns:e1-default"));
        let event = EventStore::get(f.store.as_ref(), "e1").await.unwrap();
        assert_eq!(event.workers["default"].phase(), WorkerPhase::Running);

        f.reconciler
            .handle_watch_event(UnitCategory::Worker, WatchEvent::Deleted(running));
        assert_eq!(tracker.capacity_count(), 0);
    }

    #[tokio::test]
    async fn test_job_units_update_job_status() {
        let f = fixture().await;
        let request = UnitRequest::job("ns", "e1", "default", "build", JobSpec::default());
        let job_unit = Unit {
            name: request.name,
            namespace: request.namespace,
            labels: request.labels,
            phase: UnitPhase::Running,
            started: Some(Utc::now()),
            primary_termination: None,
            deletion_requested: false,
        };
        f.reconciler
            .handle_watch_event(UnitCategory::Job, WatchEvent::Applied(job_unit));
        f.reconciler.background().drain().await;

        let event = EventStore::get(f.store.as_ref(), "e1").await.unwrap();
        let job = &event.workers["default"].jobs["build"];
        assert_eq!(job.status.phase, WorkerPhase::Running);
        assert!(job.status.started.is_some());
        assert_eq!(
            f.reconciler.tracker(UnitCategory::Job).capacity_count(),
            1
        );
    }

    #[tokio::test]
    async fn test_unlabelled_units_are_ignored() {
        let f = fixture().await;
        let mut stray = unit(UnitPhase::Running);
        stray.labels.remove(labels::EVENT);
        f.reconciler
            .handle_watch_event(UnitCategory::Worker, WatchEvent::Applied(stray));
        f.reconciler.background().drain().await;
        assert_eq!(f.reconciler.background().stats().spawned, 0);
    }
}
