//! # Job Model
//!
//! Jobs are spawned by a running Worker's own logic. The core only tracks
//! their status, which is driven entirely by the reconciler.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::worker::{ContainerSpec, WorkerPhase, WorkerStatus};

/// Jobs share the Worker lifecycle and its forward-only invariant.
pub type JobPhase = WorkerPhase;
pub type JobStatus = WorkerStatus;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default)]
    pub primary_container: ContainerSpec,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sidecar_containers: BTreeMap<String, ContainerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            status: JobStatus::pending(),
        }
    }
}
