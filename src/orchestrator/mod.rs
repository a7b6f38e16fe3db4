//! Per-project supervision: admission control, the run-loop lifecycle, and
//! the stop/pause/resume surface.
//!
//! One entry per active project lives in a shared map guarded by a single
//! mutex; the admission cap counts active (initializing or running) entries
//! under that same lock, so the (N+1)-th start can never slip through.

mod run_loop;
pub mod selection;

pub use selection::select_next_task;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::{AgentRunner, CancelToken};
use crate::config::EnginePaths;
use crate::events::{EventBus, OrchestratorLogPayload, EVENT_ORCHESTRATOR_LOG};
use crate::git::GitDriver;
use crate::models::{ProjectStatus, TaskStatus};
use crate::state::StateManager;
use crate::utils::{lock_mutex_recover, now_iso};
use crate::verify::Verifier;
use crate::workspace::WorkspaceStore;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Project {0} is already running")]
    AlreadyRunning(String),

    #[error("Maximum number of parallel projects reached")]
    CapacityExceeded,

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Lifecycle of one orchestrator entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initializing,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

/// Externally visible state of one active project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub status: RunStatus,
    pub current_task_id: Option<String>,
    pub current_process_id: Option<u32>,
}

pub(crate) struct ProjectEntry {
    pub state: RunState,
    pub cancel: CancelToken,
}

pub(crate) type SharedEntries = Arc<Mutex<HashMap<String, ProjectEntry>>>;

pub struct Orchestrator {
    state: Arc<StateManager>,
    workspace: Arc<WorkspaceStore>,
    git: Arc<GitDriver>,
    runner: Arc<AgentRunner>,
    verifier: Arc<Verifier>,
    events: Arc<EventBus>,
    paths: EnginePaths,
    entries: SharedEntries,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StateManager>,
        workspace: Arc<WorkspaceStore>,
        git: Arc<GitDriver>,
        runner: Arc<AgentRunner>,
        verifier: Arc<Verifier>,
        events: Arc<EventBus>,
        paths: EnginePaths,
    ) -> Self {
        Self {
            state,
            workspace,
            git,
            runner,
            verifier,
            events,
            paths,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admit a project and launch its run loop.
    pub fn start(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let project = self
            .state
            .get_project(project_id)
            .map_err(|_| OrchestratorError::NotFound(format!("project {}", project_id)))?;
        let settings = self.state.settings();

        let cancel = CancelToken::new();
        {
            let mut entries = lock_mutex_recover(&self.entries);

            if let Some(entry) = entries.get(project_id) {
                match entry.state.status {
                    // A paused entry is resumable; anything active is not
                    RunStatus::Paused => {
                        entries.remove(project_id);
                    }
                    _ => return Err(OrchestratorError::AlreadyRunning(project_id.to_string())),
                }
            }

            let active = entries
                .values()
                .filter(|e| {
                    matches!(
                        e.state.status,
                        RunStatus::Initializing | RunStatus::Running
                    )
                })
                .count();
            if active >= settings.max_parallel_projects {
                return Err(OrchestratorError::CapacityExceeded);
            }

            entries.insert(
                project_id.to_string(),
                ProjectEntry {
                    state: RunState {
                        status: RunStatus::Initializing,
                        current_task_id: None,
                        current_process_id: None,
                    },
                    cancel: cancel.clone(),
                },
            );
        }

        if let Err(e) = self
            .state
            .set_project_status(project_id, ProjectStatus::Running)
        {
            lock_mutex_recover(&self.entries).remove(project_id);
            return Err(OrchestratorError::NotFound(e.to_string()));
        }

        self.emit_log(project_id, format!("Starting project '{}'", project.name));

        let ctx = run_loop::LoopContext {
            project_id: project_id.to_string(),
            state: Arc::clone(&self.state),
            workspace: Arc::clone(&self.workspace),
            git: Arc::clone(&self.git),
            runner: Arc::clone(&self.runner),
            verifier: Arc::clone(&self.verifier),
            events: Arc::clone(&self.events),
            paths: self.paths.clone(),
            entries: Arc::clone(&self.entries),
            cancel,
        };
        tokio::spawn(run_loop::run_project(ctx));

        Ok(())
    }

    /// Stop a project: cancel the in-flight agent, revert the interrupted
    /// task to backlog, and return the project to idle. Safe to call at any
    /// time.
    pub fn stop(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let entry = lock_mutex_recover(&self.entries).remove(project_id);
        let Some(entry) = entry else {
            return Err(OrchestratorError::NotFound(format!(
                "no active entry for project {}",
                project_id
            )));
        };
        entry.cancel.cancel();

        // Revert interrupted work so a later start picks it up fresh
        let revert = self.workspace.mutate_tasks(project_id, |file| {
            for task in file.tasks.iter_mut() {
                if task.status == TaskStatus::InProgress {
                    task.status = TaskStatus::Backlog;
                    task.started_at = None;
                    task.verifying_at = None;
                    task.completed_at = None;
                }
            }
        });
        if let Err(e) = revert {
            log::warn!(
                "[Orchestrator] Failed to revert in-progress task for {}: {}",
                project_id,
                e
            );
        }

        if let Err(e) = self.state.set_project_status(project_id, ProjectStatus::Idle) {
            log::warn!("[Orchestrator] Failed to set project idle: {}", e);
        }

        self.emit_log(project_id, "Project stopped".to_string());
        Ok(())
    }

    /// Flag a project as paused. The loop observes the flag at the next
    /// iteration boundary; an in-flight agent pass is allowed to finish.
    pub fn pause(&self, project_id: &str) -> Result<(), OrchestratorError> {
        {
            let mut entries = lock_mutex_recover(&self.entries);
            let entry = entries.get_mut(project_id).ok_or_else(|| {
                OrchestratorError::NotFound(format!("no active entry for project {}", project_id))
            })?;
            entry.state.status = RunStatus::Paused;
        }

        self.state
            .set_project_status(project_id, ProjectStatus::Paused)
            .map_err(|e| OrchestratorError::NotFound(e.to_string()))?;

        self.emit_log(project_id, "Project paused".to_string());
        Ok(())
    }

    /// Resume a paused project by dispatching a fresh start.
    pub fn resume(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let project = self
            .state
            .get_project(project_id)
            .map_err(|_| OrchestratorError::NotFound(format!("project {}", project_id)))?;
        if project.status != ProjectStatus::Paused {
            return Err(OrchestratorError::NotFound(format!(
                "project {} is not paused",
                project_id
            )));
        }
        self.start(project_id)
    }

    /// Current run state per active project.
    pub fn status(&self) -> HashMap<String, RunState> {
        let entries = lock_mutex_recover(&self.entries);
        entries
            .iter()
            .map(|(id, entry)| {
                let mut state = entry.state.clone();
                state.current_process_id = self.runner.active_pid(id);
                (id.clone(), state)
            })
            .collect()
    }

    fn emit_log(&self, project_id: &str, message: String) {
        log::info!("[Orchestrator] {}: {}", project_id, message);
        self.events.emit(
            EVENT_ORCHESTRATOR_LOG,
            OrchestratorLogPayload {
                project_id: project_id.to_string(),
                message,
                timestamp: now_iso(),
            },
        );
    }
}
