//! # Execution Substrate
//!
//! Boundary to the container-orchestration system that runs execution units
//! ("pods") for Workers and Jobs. The core only needs create, list, watch and
//! delete, all scoped by equality label selectors.
//!
//! Units are labelled with their component (`worker` or `job`), the owning
//! Event and Worker, and for Job units the Job name. The reconciler relies on
//! those labels to route observations back to domain entities.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{components, job_unit_name, labels, namespaced_name, worker_unit_name};
use crate::error::Result;
use crate::models::{JobSpec, WorkerSpec};

pub use memory::MemorySubstrate;

/// Substrate-reported phase of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl UnitPhase {
    /// The unit will not run again and may be cleaned up.
    pub fn is_finished(self) -> bool {
        matches!(self, UnitPhase::Succeeded | UnitPhase::Failed)
    }
}

/// Termination record of a unit's primary container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerTermination {
    pub succeeded: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time observation of one execution unit. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub phase: UnitPhase,
    pub started: Option<DateTime<Utc>>,
    pub primary_termination: Option<ContainerTermination>,
    /// Set once anyone has asked the substrate to remove the unit.
    pub deletion_requested: bool,
}

impl Unit {
    pub fn namespaced_name(&self) -> String {
        namespaced_name(&self.namespace, &self.name)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitSpec {
    Worker(WorkerSpec),
    Job(JobSpec),
}

/// Request to create one execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRequest {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub spec: UnitSpec,
}

impl UnitRequest {
    pub fn worker(
        namespace: impl Into<String>,
        project_id: &str,
        event_id: &str,
        worker_name: &str,
        spec: WorkerSpec,
    ) -> Self {
        let mut unit_labels = BTreeMap::new();
        unit_labels.insert(labels::COMPONENT.to_string(), components::WORKER.to_string());
        unit_labels.insert(labels::PROJECT.to_string(), project_id.to_string());
        unit_labels.insert(labels::EVENT.to_string(), event_id.to_string());
        unit_labels.insert(labels::WORKER.to_string(), worker_name.to_string());
        Self {
            name: worker_unit_name(event_id, worker_name),
            namespace: namespace.into(),
            labels: unit_labels,
            spec: UnitSpec::Worker(spec),
        }
    }

    /// Job units are normally created by a running Worker. The core only
    /// needs this to describe them.
    pub fn job(
        namespace: impl Into<String>,
        event_id: &str,
        worker_name: &str,
        job_name: &str,
        spec: JobSpec,
    ) -> Self {
        let mut unit_labels = BTreeMap::new();
        unit_labels.insert(labels::COMPONENT.to_string(), components::JOB.to_string());
        unit_labels.insert(labels::EVENT.to_string(), event_id.to_string());
        unit_labels.insert(labels::WORKER.to_string(), worker_name.to_string());
        unit_labels.insert(labels::JOB.to_string(), job_name.to_string());
        Self {
            name: job_unit_name(event_id, worker_name, job_name),
            namespace: namespace.into(),
            labels: unit_labels,
            spec: UnitSpec::Job(spec),
        }
    }
}

/// Equality-only label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    requirements: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }

    pub fn component(component: &str) -> Self {
        Self::new().with(labels::COMPONENT, component)
    }

    pub fn worker_units() -> Self {
        Self::component(components::WORKER)
    }

    pub fn job_units() -> Self {
        Self::component(components::JOB)
    }

    /// Every unit, of either component, belonging to one Event.
    pub fn event(event_id: &str) -> Self {
        Self::new().with(labels::EVENT, event_id)
    }

    pub fn matches(&self, unit_labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|(k, v)| unit_labels.get(k) == Some(v))
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        f.write_str(&parts.join(","))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// The unit was added or changed.
    Applied(Unit),
    /// The substrate confirmed the unit is gone.
    Deleted(Unit),
}

#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    /// Fails with `Conflict` when a unit with the same name exists in the
    /// namespace.
    async fn create_unit(&self, request: UnitRequest) -> Result<()>;

    async fn list_units(&self, namespace: Option<&str>, selector: &LabelSelector)
        -> Result<Vec<Unit>>;

    /// Changes to matching units from now on.
    async fn watch_units(&self, selector: &LabelSelector)
        -> Result<BoxStream<'static, WatchEvent>>;

    /// Fails with `NotFound` for an unknown unit.
    async fn delete_unit(&self, namespace: &str, name: &str) -> Result<()>;

    /// Returns how many units were asked to go away.
    async fn delete_units(&self, namespace: Option<&str>, selector: &LabelSelector)
        -> Result<usize>;
}
