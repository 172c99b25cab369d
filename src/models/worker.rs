//! # Worker Model
//!
//! A Worker is one isolated execution unit running an Event's automation
//! logic. Workers are owned by exactly one Event and keyed by name; each may
//! spawn Jobs (see [`super::job`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::job::Job;
use crate::error::EventflowError;

/// Where a Worker (or Job) is within its lifecycle.
///
/// Phases only move forward: PENDING, then RUNNING, then exactly one
/// terminal phase. A terminal phase is never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerPhase {
    Pending,
    Running,
    Canceled,
    Aborted,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkerPhase {
    pub fn all() -> Vec<WorkerPhase> {
        vec![
            WorkerPhase::Pending,
            WorkerPhase::Running,
            WorkerPhase::Canceled,
            WorkerPhase::Aborted,
            WorkerPhase::Succeeded,
            WorkerPhase::Failed,
            WorkerPhase::Unknown,
        ]
    }

    pub fn terminal() -> Vec<WorkerPhase> {
        Self::all().into_iter().filter(|p| p.is_terminal()).collect()
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkerPhase::Pending | WorkerPhase::Running)
    }

    fn rank(self) -> u8 {
        match self {
            WorkerPhase::Pending => 0,
            WorkerPhase::Running => 1,
            _ => 2,
        }
    }

    /// RUNNING to RUNNING is permitted so that late timestamps can land.
    pub fn can_transition_to(self, next: WorkerPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank() || (self == WorkerPhase::Running && next == WorkerPhase::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerPhase::Pending => "PENDING",
            WorkerPhase::Running => "RUNNING",
            WorkerPhase::Canceled => "CANCELED",
            WorkerPhase::Aborted => "ABORTED",
            WorkerPhase::Succeeded => "SUCCEEDED",
            WorkerPhase::Failed => "FAILED",
            WorkerPhase::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerPhase {
    type Err = EventflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerPhase::all()
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EventflowError::bad_request(format!("unknown worker phase {s:?}")))
    }
}

/// Status of a Worker or Job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub phase: WorkerPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::pending()
    }
}

impl WorkerStatus {
    pub fn pending() -> Self {
        Self {
            phase: WorkerPhase::Pending,
            started: None,
            ended: None,
        }
    }

    pub fn with_phase(phase: WorkerPhase) -> Self {
        Self {
            phase,
            started: None,
            ended: None,
        }
    }

    /// Conditionally apply `next` on top of this status.
    ///
    /// Returns `false`, leaving the status untouched, when the phase change
    /// is not a forward move. Timestamps already recorded are kept when
    /// `next` does not carry them.
    pub fn apply(&mut self, next: &WorkerStatus) -> bool {
        if !self.phase.can_transition_to(next.phase) {
            return false;
        }
        self.phase = next.phase;
        if next.started.is_some() {
            self.started = next.started;
        }
        if next.ended.is_some() {
            self.ended = next.ended;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// OCI container details for a Worker or Job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_pull_policy: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

/// Git details for a Worker. Empty strings mean "unset".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    #[serde(default, rename = "cloneURL", skip_serializing_if = "String::is_empty")]
    pub clone_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,
    #[serde(default, rename = "ref", skip_serializing_if = "String::is_empty")]
    pub git_ref: String,
    #[serde(default)]
    pub init_submodules: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSubstrateConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

/// Policies governing Jobs a Worker may spawn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPolicies {
    #[serde(default)]
    pub allow_privileged: bool,
    #[serde(default)]
    pub allow_docker_socket_mount: bool,
}

/// Technical blueprint for a Worker. Projects carry these as templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
    #[serde(default)]
    pub use_workspace: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substrate: Option<WorkerSubstrateConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_policies: Option<JobPolicies>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_files_directory: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default_config_files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub spec: WorkerSpec,
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub jobs: BTreeMap<String, Job>,
}

impl Worker {
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            status: WorkerStatus::pending(),
            jobs: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        self.status.phase
    }
}
