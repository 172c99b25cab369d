//! # Event Processor
//!
//! Fans an ACCEPTED Event out into its Workers. The Project's Worker
//! templates are merged with the Event's git overrides, defaults are filled
//! in, and the Workers land together with the PROCESSING status (or MOOT when
//! there are none) in a single conditional store write.
//!
//! Redelivery is expected. An Event that is already PROCESSING gets the same
//! follow-up tasks recomputed from its persisted Workers without another
//! write, so fan-out happens exactly once however often the task arrives.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::ProcessingConfig;
use crate::constants::worker_defaults;
use crate::error::Result;
use crate::logging::log_event_operation;
use crate::models::{Event, EventStatus, GitConfig, LogLevel, Project, Worker};
use crate::queue::{ScheduledTask, Task};
use crate::store::{EventStore, ProjectStore};

pub struct EventProcessor {
    events: Arc<dyn EventStore>,
    projects: Arc<dyn ProjectStore>,
    delays: ProcessingConfig,
}

impl EventProcessor {
    pub fn new(
        events: Arc<dyn EventStore>,
        projects: Arc<dyn ProjectStore>,
        delays: ProcessingConfig,
    ) -> Self {
        Self {
            events,
            projects,
            delays,
        }
    }

    /// Handles one `EventProcess` delivery and returns the follow-ups.
    #[instrument(skip(self))]
    pub async fn process_event(&self, event_id: &str) -> Result<Vec<ScheduledTask>> {
        let event = match self.events.get(event_id).await {
            Ok(event) => event,
            Err(e) if e.is_not_found() => {
                debug!("Event no longer exists, nothing to process");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        match event.status {
            EventStatus::Accepted => {}
            EventStatus::Processing => {
                debug!("Event already processing, replaying follow-ups");
                return Ok(self.follow_ups(&event));
            }
            EventStatus::Moot => {
                info!(status = %event.status, "Event already processed, ignoring delivery");
                return Ok(Vec::new());
            }
        }

        let project = match self.projects.get(&event.project_id).await {
            Ok(project) => project,
            Err(e) if e.is_not_found() => {
                warn!(project_id = %event.project_id, "Project not found, skipping event");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let workers = compute_workers(&project, &event);
        let status = if workers.is_empty() {
            EventStatus::Moot
        } else {
            EventStatus::Processing
        };

        let applied = match self
            .events
            .update_workers_and_status(&event.id, &workers, status)
            .await
        {
            Ok(applied) => applied,
            Err(e) if e.is_not_found() => {
                debug!("Event deleted during processing");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        if !applied {
            // A concurrent delivery won the fan-out. Follow its result.
            return match self.events.get(&event.id).await {
                Ok(current) if current.status == EventStatus::Processing => {
                    Ok(self.follow_ups(&current))
                }
                Ok(_) => Ok(Vec::new()),
                Err(e) if e.is_not_found() => Ok(Vec::new()),
                Err(e) => Err(e),
            };
        }

        log_event_operation("process_event", &event.id, Some(&event.project_id), status.as_str());
        if status == EventStatus::Moot {
            return Ok(Vec::new());
        }

        let mut processed = event;
        processed.workers = workers;
        processed.status = status;
        Ok(self.follow_ups(&processed))
    }

    /// One delayed `ExecuteWorker` per Worker plus one delayed `MonitorEvent`.
    fn follow_ups(&self, event: &Event) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = event
            .workers
            .keys()
            .map(|name| {
                Task::execute_worker(&event.id, name).after(self.delays.execute_worker_delay())
            })
            .collect();
        tasks.push(Task::monitor_event(&event.id).after(self.delays.monitor_event_delay()));
        tasks
    }
}

fn override_if_set(target: &mut String, value: &str) {
    if !value.is_empty() {
        *target = value.to_string();
    }
}

/// Workers for `event`, one per Worker template of `project`.
///
/// Event-level git values win over the template's when non-empty. A clone
/// URL with neither commit nor ref defaults the ref to `master`. Workspace
/// size, log level and config-file directory get defaults when unset.
pub fn compute_workers(project: &Project, event: &Event) -> BTreeMap<String, Worker> {
    project
        .spec
        .worker_templates
        .iter()
        .map(|(name, template)| {
            let mut spec = template.clone();

            if let Some(overrides) = &event.git {
                let git = spec.git.get_or_insert_with(GitConfig::default);
                override_if_set(&mut git.clone_url, &overrides.clone_url);
                override_if_set(&mut git.commit, &overrides.commit);
                override_if_set(&mut git.git_ref, &overrides.git_ref);
            }
            if let Some(git) = spec.git.as_mut() {
                if !git.clone_url.is_empty() && git.commit.is_empty() && git.git_ref.is_empty() {
                    git.git_ref = worker_defaults::GIT_REF.to_string();
                }
            }

            if spec.workspace_size.is_empty() {
                spec.workspace_size = worker_defaults::WORKSPACE_SIZE.to_string();
            }
            if spec.log_level.is_none() {
                spec.log_level = Some(LogLevel::Info);
            }
            if spec.config_files_directory.is_empty() {
                spec.config_files_directory = worker_defaults::CONFIG_FILES_DIRECTORY.to_string();
            }

            (name.clone(), Worker::new(spec))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventGitConfig, WorkerPhase, WorkerSpec};
    use crate::store::MemoryStore;
    use std::time::Duration;

    async fn fixture(project: Project) -> (EventProcessor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        ProjectStore::create(store.as_ref(), &project).await.unwrap();
        let mut event = Event::new("github", "push").with_project(&project.id);
        event.id = "e1".into();
        EventStore::create(store.as_ref(), &event).await.unwrap();
        let processor = EventProcessor::new(
            store.clone(),
            store.clone(),
            ProcessingConfig::default(),
        );
        (processor, store)
    }

    #[test]
    fn test_compute_workers_merges_git_and_defaults() {
        let template = WorkerSpec {
            git: Some(GitConfig {
                clone_url: "https://example.com/template.git".into(),
                commit: "abc123".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let project = Project::new("p1", "ns").with_worker_template(template);
        let event = Event::new("github", "push").with_git(EventGitConfig {
            clone_url: "https://example.com/fork.git".into(),
            ..Default::default()
        });

        let workers = compute_workers(&project, &event);
        let spec = &workers["default"].spec;
        let git = spec.git.as_ref().unwrap();
        assert_eq!(git.clone_url, "https://example.com/fork.git");
        assert_eq!(git.commit, "abc123");
        assert_eq!(git.git_ref, "");
        assert_eq!(spec.workspace_size, "10Gi");
        assert_eq!(spec.log_level, Some(LogLevel::Info));
        assert_eq!(spec.config_files_directory, ".");
        assert_eq!(workers["default"].phase(), WorkerPhase::Pending);
    }

    #[test]
    fn test_compute_workers_defaults_ref_to_master() {
        let project = Project::new("p1", "ns").with_worker_template(WorkerSpec::default());
        let event = Event::new("github", "push").with_git(EventGitConfig {
            clone_url: "https://example.com/repo.git".into(),
            ..Default::default()
        });
        let workers = compute_workers(&project, &event);
        assert_eq!(workers["default"].spec.git.as_ref().unwrap().git_ref, "master");

        let no_git = compute_workers(&project, &Event::new("github", "push"));
        assert!(no_git["default"].spec.git.is_none());
    }

    #[tokio::test]
    async fn test_process_event_fans_out_once() {
        let project = Project::new("p1", "ns").with_worker_template(WorkerSpec::default());
        let (processor, store) = fixture(project).await;

        let first = processor.process_event("e1").await.unwrap();
        let second = processor.process_event("e1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                Task::execute_worker("e1", "default").after(Duration::from_secs(5)),
                Task::monitor_event("e1").after(Duration::from_secs(5)),
            ]
        );
        let event = EventStore::get(store.as_ref(), "e1").await.unwrap();
        assert_eq!(event.status, EventStatus::Processing);
        assert_eq!(event.workers.len(), 1);
    }

    #[tokio::test]
    async fn test_process_event_without_templates_is_moot() {
        let (processor, store) = fixture(Project::new("p1", "ns")).await;
        assert!(processor.process_event("e1").await.unwrap().is_empty());
        let event = EventStore::get(store.as_ref(), "e1").await.unwrap();
        assert_eq!(event.status, EventStatus::Moot);
        assert!(processor.process_event("e1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_event_or_project_is_a_no_op() {
        let (processor, store) = fixture(Project::new("p1", "ns")).await;
        assert!(processor.process_event("missing").await.unwrap().is_empty());

        let mut orphan = Event::new("github", "push").with_project("nope");
        orphan.id = "e2".into();
        EventStore::create(store.as_ref(), &orphan).await.unwrap();
        assert!(processor.process_event("e2").await.unwrap().is_empty());
        let event = EventStore::get(store.as_ref(), "e2").await.unwrap();
        assert_eq!(event.status, EventStatus::Accepted);
    }
}
