//! # Event Model
//!
//! An Event is an externally triggered occurrence that fans out into one or
//! more Workers. Admission creates it in the ACCEPTED state; the event
//! processor moves it forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::worker::Worker;

/// Forward-only Event phase. An Event is implicitly complete once every one
/// of its Workers is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Accepted,
    Processing,
    /// No Worker matched the Event.
    Moot,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Accepted => "ACCEPTED",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Moot => "MOOT",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-level git overrides. Non-empty values win over the project's
/// worker template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventGitConfig {
    #[serde(default, rename = "cloneURL", skip_serializing_if = "String::is_empty")]
    pub clone_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,
    #[serde(default, rename = "ref", skip_serializing_if = "String::is_empty")]
    pub git_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub id: String,
    /// Empty until resolved; unresolved events fan out by subscription.
    #[serde(default, rename = "projectID")]
    pub project_id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub short_title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub long_title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<EventGitConfig>,
    /// Substrate namespace the Event's units run in.
    #[serde(default)]
    pub namespace: String,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub workers: BTreeMap<String, Worker>,
}

impl Event {
    /// New, unpersisted Event in the ACCEPTED state.
    pub fn new(source: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            project_id: String::new(),
            source: source.into(),
            event_type: event_type.into(),
            labels: BTreeMap::new(),
            short_title: String::new(),
            long_title: String::new(),
            payload: String::new(),
            git: None,
            namespace: String::new(),
            status: EventStatus::Accepted,
            created: None,
            canceled: None,
            workers: BTreeMap::new(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_git(mut self, git: EventGitConfig) -> Self {
        self.git = Some(git);
        self
    }

    /// True when processing produced no Workers, or every Worker finished.
    pub fn is_complete(&self) -> bool {
        match self.status {
            EventStatus::Moot => true,
            EventStatus::Accepted => false,
            EventStatus::Processing => self.workers.values().all(|w| w.phase().is_terminal()),
        }
    }
}
