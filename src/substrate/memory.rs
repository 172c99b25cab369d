//! In-process execution substrate.
//!
//! Units never run on their own: tests (or an embedding process) drive phase
//! changes through [`MemorySubstrate::update_unit`]. Every change is
//! broadcast to watchers, and deletion behaves like a graceful delete: the
//! unit is first re-published with its deletion marker set, then removed
//! and announced as deleted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::{
    ContainerTermination, ExecutionSubstrate, LabelSelector, Unit, UnitPhase, UnitRequest,
    UnitSpec, WatchEvent,
};
use crate::constants::namespaced_name;
use crate::error::{EventflowError, Result};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct StoredUnit {
    unit: Unit,
    spec: UnitSpec,
}

#[derive(Debug)]
pub struct MemorySubstrate {
    units: Mutex<BTreeMap<String, StoredUnit>>,
    deletions: Mutex<HashMap<String, usize>>,
    create_failures: AtomicUsize,
    created: AtomicUsize,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::with_watch_capacity(WATCH_CHANNEL_CAPACITY)
    }

    /// Watchers falling more than `capacity` events behind see their stream
    /// end.
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            units: Mutex::new(BTreeMap::new()),
            deletions: Mutex::new(HashMap::new()),
            create_failures: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            events,
        }
    }

    fn publish(&self, event: WatchEvent) {
        // No watchers is fine.
        let _ = self.events.send(event);
    }

    /// Makes the next `count` creations fail with a substrate error.
    pub fn fail_next_creates(&self, count: usize) {
        self.create_failures.store(count, Ordering::SeqCst);
    }

    pub fn unit(&self, namespace: &str, name: &str) -> Option<Unit> {
        self.units
            .lock()
            .get(&namespaced_name(namespace, name))
            .map(|s| s.unit.clone())
    }

    pub fn unit_spec(&self, namespace: &str, name: &str) -> Option<UnitSpec> {
        self.units
            .lock()
            .get(&namespaced_name(namespace, name))
            .map(|s| s.spec.clone())
    }

    pub fn unit_count(&self) -> usize {
        self.units.lock().len()
    }

    /// Successful creations over the substrate's lifetime.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// How many times deletion of one unit was requested.
    pub fn deletion_count(&self, namespace: &str, name: &str) -> usize {
        self.deletions
            .lock()
            .get(&namespaced_name(namespace, name))
            .copied()
            .unwrap_or(0)
    }

    /// Mutates a unit in place and publishes the result to watchers.
    pub fn update_unit<F>(&self, namespace: &str, name: &str, mutate: F) -> Result<Unit>
    where
        F: FnOnce(&mut Unit),
    {
        let updated = {
            let mut units = self.units.lock();
            let stored = units
                .get_mut(&namespaced_name(namespace, name))
                .ok_or_else(|| EventflowError::not_found("Unit", namespaced_name(namespace, name)))?;
            mutate(&mut stored.unit);
            stored.unit.clone()
        };
        self.publish(WatchEvent::Applied(updated.clone()));
        Ok(updated)
    }

    pub fn set_phase(&self, namespace: &str, name: &str, phase: UnitPhase) -> Result<Unit> {
        self.update_unit(namespace, name, |unit| {
            unit.phase = phase;
            if phase == UnitPhase::Running && unit.started.is_none() {
                unit.started = Some(Utc::now());
            }
        })
    }

    /// Terminates the primary container and moves the unit to the matching
    /// finished phase.
    pub fn finish(
        &self,
        namespace: &str,
        name: &str,
        succeeded: bool,
        finished_at: DateTime<Utc>,
    ) -> Result<Unit> {
        self.update_unit(namespace, name, |unit| {
            unit.phase = if succeeded {
                UnitPhase::Succeeded
            } else {
                UnitPhase::Failed
            };
            unit.primary_termination = Some(ContainerTermination {
                succeeded,
                finished_at: Some(finished_at),
            });
        })
    }

    fn remove(&self, key: &str) -> Option<Unit> {
        let marked = {
            let mut units = self.units.lock();
            let stored = units.get_mut(key)?;
            stored.unit.deletion_requested = true;
            stored.unit.clone()
        };
        *self.deletions.lock().entry(key.to_string()).or_insert(0) += 1;
        self.publish(WatchEvent::Applied(marked.clone()));

        if self.units.lock().remove(key).is_some() {
            self.publish(WatchEvent::Deleted(marked.clone()));
        }
        Some(marked)
    }
}

#[async_trait]
impl ExecutionSubstrate for MemorySubstrate {
    async fn create_unit(&self, request: UnitRequest) -> Result<()> {
        if self
            .create_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EventflowError::substrate(
                "create_unit",
                format!("injected failure creating {}", request.name),
            ));
        }

        let key = namespaced_name(&request.namespace, &request.name);
        let unit = {
            let mut units = self.units.lock();
            if units.contains_key(&key) {
                return Err(EventflowError::conflict(
                    "Unit",
                    key,
                    "a unit with this name already exists",
                ));
            }
            let unit = Unit {
                name: request.name,
                namespace: request.namespace,
                labels: request.labels,
                phase: UnitPhase::Pending,
                started: None,
                primary_termination: None,
                deletion_requested: false,
            };
            units.insert(
                key.clone(),
                StoredUnit {
                    unit: unit.clone(),
                    spec: request.spec,
                },
            );
            unit
        };
        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(unit = %key, "Created unit");
        self.publish(WatchEvent::Applied(unit));
        Ok(())
    }

    async fn list_units(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Unit>> {
        Ok(self
            .units
            .lock()
            .values()
            .map(|s| &s.unit)
            .filter(|u| namespace.map_or(true, |ns| u.namespace == ns))
            .filter(|u| selector.matches(&u.labels))
            .cloned()
            .collect())
    }

    async fn watch_units(
        &self,
        selector: &LabelSelector,
    ) -> Result<BoxStream<'static, WatchEvent>> {
        let selector = selector.clone();
        // A lagged receiver has lost events, so the stream ends and the
        // watcher relists instead of carrying on with a gap.
        let stream = BroadcastStream::new(self.events.subscribe())
            .scan((), move |_, received| {
                let item = match received {
                    Ok(event) => {
                        let unit = match &event {
                            WatchEvent::Applied(u) | WatchEvent::Deleted(u) => u,
                        };
                        Some(selector.matches(&unit.labels).then_some(event))
                    }
                    Err(e) => {
                        warn!(selector = %selector, "Unit watch lagged, closing: {}", e);
                        None
                    }
                };
                futures::future::ready(item)
            })
            .filter_map(futures::future::ready);
        Ok(stream.boxed())
    }

    async fn delete_unit(&self, namespace: &str, name: &str) -> Result<()> {
        let key = namespaced_name(namespace, name);
        self.remove(&key)
            .map(|_| ())
            .ok_or_else(|| EventflowError::not_found("Unit", key))
    }

    async fn delete_units(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<usize> {
        let keys: Vec<String> = self
            .list_units(namespace, selector)
            .await?
            .iter()
            .map(Unit::namespaced_name)
            .collect();
        Ok(keys.iter().filter(|key| self.remove(key).is_some()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkerSpec;

    fn request() -> UnitRequest {
        UnitRequest::worker("ns", "p1", "e1", "default", WorkerSpec::default())
    }

    #[tokio::test]
    async fn test_create_conflicts_on_existing_name() {
        let substrate = MemorySubstrate::new();
        substrate.create_unit(request()).await.unwrap();
        let err = substrate.create_unit(request()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(substrate.created_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_create_failures_are_consumed() {
        let substrate = MemorySubstrate::new();
        substrate.fail_next_creates(1);
        let err = substrate.create_unit(request()).await.unwrap_err();
        assert!(err.is_retryable());
        substrate.create_unit(request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_sees_marker_then_deletion() {
        let substrate = MemorySubstrate::new();
        let mut watch = substrate
            .watch_units(&LabelSelector::worker_units())
            .await
            .unwrap();

        substrate.create_unit(request()).await.unwrap();
        substrate.set_phase("ns", "e1-default", UnitPhase::Running).unwrap();
        substrate.delete_unit("ns", "e1-default").await.unwrap();

        let created = watch.next().await.unwrap();
        assert!(matches!(created, WatchEvent::Applied(ref u) if u.phase == UnitPhase::Pending));
        let running = watch.next().await.unwrap();
        assert!(matches!(running, WatchEvent::Applied(ref u) if u.started.is_some()));
        let marked = watch.next().await.unwrap();
        assert!(matches!(marked, WatchEvent::Applied(ref u) if u.deletion_requested));
        let deleted = watch.next().await.unwrap();
        assert!(matches!(deleted, WatchEvent::Deleted(_)));

        assert_eq!(substrate.deletion_count("ns", "e1-default"), 1);
        assert!(substrate.delete_unit("ns", "e1-default").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_lagged_watch_ends_instead_of_skipping() {
        let substrate = MemorySubstrate::with_watch_capacity(2);
        let mut watch = substrate
            .watch_units(&LabelSelector::worker_units())
            .await
            .unwrap();

        for i in 0..5 {
            substrate
                .create_unit(UnitRequest::worker("ns", "p1", &format!("e{i}"), "default", WorkerSpec::default()))
                .await
                .unwrap();
        }

        assert!(watch.next().await.is_none());
        assert_eq!(substrate.unit_count(), 5);
    }

    #[tokio::test]
    async fn test_delete_units_by_selector() {
        let substrate = MemorySubstrate::new();
        substrate.create_unit(request()).await.unwrap();
        substrate
            .create_unit(UnitRequest::job("ns", "e1", "default", "build", Default::default()))
            .await
            .unwrap();
        substrate
            .create_unit(UnitRequest::worker("ns", "p1", "e2", "default", WorkerSpec::default()))
            .await
            .unwrap();

        let removed = substrate
            .delete_units(Some("ns"), &LabelSelector::event("e1"))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(substrate.unit_count(), 1);
    }
}
