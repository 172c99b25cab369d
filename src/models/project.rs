//! # Project Model
//!
//! Projects are managed outside the core. The event processor reads their
//! worker templates and admission reads their subscriptions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::event::Event;
use super::worker::WorkerSpec;
use crate::constants::worker_defaults;

/// Subscription of a Project to Events from one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub source: String,
    /// Empty means every type from the source.
    #[serde(default)]
    pub types: Vec<String>,
    /// Every subscription label must be present on the Event with an equal value.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl EventSubscription {
    pub fn matches(&self, event: &Event) -> bool {
        if self.source.is_empty()
            || event.source.is_empty()
            || event.event_type.is_empty()
            || self.source != event.source
        {
            return false;
        }
        if !self.types.is_empty() && !self.types.iter().any(|t| *t == event.event_type) {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| event.labels.get(k).is_some_and(|ev| ev == v))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    #[serde(default)]
    pub event_subscriptions: Vec<EventSubscription>,
    /// Worker templates keyed by Worker name.
    #[serde(default)]
    pub worker_templates: BTreeMap<String, WorkerSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Substrate namespace for the Project's units.
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub spec: ProjectSpec,
}

impl Project {
    pub fn new(id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Registers `spec` as the template for the default Worker.
    pub fn with_worker_template(mut self, spec: WorkerSpec) -> Self {
        self.spec
            .worker_templates
            .insert(worker_defaults::WORKER_NAME.to_string(), spec);
        self
    }

    pub fn with_subscription(mut self, subscription: EventSubscription) -> Self {
        self.spec.event_subscriptions.push(subscription);
        self
    }

    pub fn is_subscribed_to(&self, event: &Event) -> bool {
        self.spec.event_subscriptions.iter().any(|s| s.matches(event))
    }
}
