//! # Log Entries
//!
//! Log lines are written by an external agent into an append-only collection
//! keyed by `{event, component, container}`. The core only reads them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{components, worker_defaults};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    pub message: String,
}

/// Which logs a caller wants. Leaving `job` unset selects Worker logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsSelector {
    #[serde(default)]
    pub job: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
}

impl LogsSelector {
    pub fn worker() -> Self {
        Self::default()
    }

    pub fn job(job: impl Into<String>) -> Self {
        Self {
            job: Some(job.into()),
            container: None,
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Store criteria for this selector within one Event.
    pub fn criteria(&self, event_id: &str) -> LogCriteria {
        let container = self.container.as_deref().filter(|c| !c.is_empty());
        match self.job.as_deref().filter(|j| !j.is_empty()) {
            None => LogCriteria {
                event_id: event_id.to_string(),
                component: components::WORKER.to_string(),
                container: container.unwrap_or(worker_defaults::CONTAINER_NAME).to_string(),
            },
            // A Job's primary container is named after the Job.
            Some(job) => LogCriteria {
                event_id: event_id.to_string(),
                component: components::JOB.to_string(),
                container: container.unwrap_or(job).to_string(),
            },
        }
    }
}

/// Exact-match criteria against the log collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogCriteria {
    #[serde(rename = "event")]
    pub event_id: String,
    pub component: String,
    pub container: String,
}

impl LogCriteria {
    /// Matches a raw stored document carrying `event`, `component` and
    /// `container` fields.
    pub fn matches(&self, document: &serde_json::Value) -> bool {
        document.get("event").and_then(|v| v.as_str()) == Some(self.event_id.as_str())
            && document.get("component").and_then(|v| v.as_str()) == Some(self.component.as_str())
            && document.get("container").and_then(|v| v.as_str()) == Some(self.container.as_str())
    }
}
