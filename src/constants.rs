//! # System Constants
//!
//! Label keys, component names and default values shared by the event
//! processor, the worker executor, the reconciler and the log streamer.

use std::time::Duration;

/// Labels stamped on every execution unit. They drive both selector-based
/// listing and status-update correlation.
pub mod labels {
    pub const COMPONENT: &str = "eventflow.io/component";
    pub const PROJECT: &str = "eventflow.io/project";
    pub const EVENT: &str = "eventflow.io/event";
    pub const WORKER: &str = "eventflow.io/worker";
    pub const JOB: &str = "eventflow.io/job";
}

/// Values of the component label, also used as log-store components.
pub mod components {
    pub const WORKER: &str = "worker";
    pub const JOB: &str = "job";
}

/// Defaults applied while computing an Event's Workers.
pub mod worker_defaults {
    pub const WORKER_NAME: &str = "default";
    pub const CONTAINER_NAME: &str = "worker";
    pub const GIT_REF: &str = "master";
    pub const WORKSPACE_SIZE: &str = "10Gi";
    pub const CONFIG_FILES_DIRECTORY: &str = ".";
}

/// Default timings for follow-up tasks and reconciliation.
pub mod timing {
    use super::Duration;

    /// Tolerates store replication lag between fan-out and execution.
    pub const EXECUTE_WORKER_DELAY: Duration = Duration::from_secs(5);
    pub const MONITOR_EVENT_DELAY: Duration = Duration::from_secs(5);
    pub const MONITOR_WORKER_DELAY: Duration = Duration::from_secs(10);
    /// Lets external log consumers finish reading before a unit is removed.
    pub const UNIT_DELETION_GRACE: Duration = Duration::from_secs(60);
    pub const LOG_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const STATUS_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Deterministic unit name for a Worker. Retried creations collide on this
/// name, which makes creation naturally idempotent.
pub fn worker_unit_name(event_id: &str, worker_name: &str) -> String {
    format!("{event_id}-{worker_name}")
}

/// Deterministic unit name for a Job.
pub fn job_unit_name(event_id: &str, worker_name: &str, job_name: &str) -> String {
    format!("{event_id}-{worker_name}-{job_name}")
}

/// Key used by the reconciler's bookkeeping sets.
pub fn namespaced_name(namespace: &str, name: &str) -> String {
    format!("{namespace}:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_names_are_deterministic() {
        assert_eq!(worker_unit_name("e1", "default"), "e1-default");
        assert_eq!(worker_unit_name("e1", "default"), worker_unit_name("e1", "default"));
        assert_eq!(job_unit_name("e1", "default", "build"), "e1-default-build");
        assert_eq!(namespaced_name("ns", "e1-default"), "ns:e1-default");
    }
}
