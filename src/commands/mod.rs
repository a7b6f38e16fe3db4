//! IPC command handlers.
//!
//! One function per request/response channel exposed to the UI. Handlers are
//! thin: they validate input, delegate to the owning component, and map
//! errors to strings at the boundary. The transport (WebSocket/IPC bridge)
//! lives outside the engine and calls these directly.

use std::collections::HashMap;

use serde::Deserialize;

use crate::models::{
    AppState, LoopLogFile, Project, Repository, Settings, Task, TaskLogEntry, TaskStatus,
};
use crate::orchestrator::RunState;
use crate::state::{ProjectInput, ProjectPatch, RepositoryInput, SettingsPatch};
use crate::Engine;

// ========== state:* ==========

pub fn state_get(engine: &Engine) -> AppState {
    engine.state.get_state()
}

pub fn state_save(engine: &Engine, settings: SettingsPatch) -> Result<Settings, String> {
    engine
        .state
        .update_settings(settings)
        .map_err(|e| e.to_string())
}

// ========== repository:* ==========

pub fn repository_list(engine: &Engine) -> Vec<Repository> {
    engine.state.get_state().repositories
}

pub fn repository_create(engine: &Engine, input: RepositoryInput) -> Result<Repository, String> {
    engine
        .state
        .create_repository(input)
        .map_err(|e| e.to_string())
}

pub fn repository_delete(engine: &Engine, id: &str) -> Result<(), String> {
    engine.state.delete_repository(id).map_err(|e| e.to_string())
}

// ========== project:* ==========

pub fn project_list(engine: &Engine) -> Vec<Project> {
    engine.state.get_state().projects
}

pub fn project_get(engine: &Engine, id: &str) -> Result<Project, String> {
    engine.state.get_project(id).map_err(|e| e.to_string())
}

pub fn project_create(engine: &Engine, input: ProjectInput) -> Result<Project, String> {
    engine.state.create_project(input).map_err(|e| e.to_string())
}

pub fn project_update(engine: &Engine, id: &str, patch: ProjectPatch) -> Result<Project, String> {
    engine
        .state
        .update_project(id, patch)
        .map_err(|e| e.to_string())
}

/// Delete a project: stop it if active, drop its workspace, remove the record.
pub fn project_delete(engine: &Engine, id: &str) -> Result<(), String> {
    let _ = engine.orchestrator.stop(id);
    engine.workspace.remove_workspace(id)?;
    engine.state.delete_project(id).map_err(|e| e.to_string())
}

pub fn project_clear_loop_logs(engine: &Engine, id: &str) -> Result<(), String> {
    engine.workspace.clear_logs(id)
}

pub fn project_get_workspace_logs(engine: &Engine, id: &str) -> Result<LoopLogFile, String> {
    engine.workspace.read_logs(id)
}

// ========== task:* ==========

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

/// Tasks for a project, with their run-log index attached.
pub fn task_list(engine: &Engine, project_id: &str) -> Result<Vec<Task>, String> {
    let file = engine.workspace.read_tasks(project_id)?;
    Ok(file
        .tasks
        .into_iter()
        .map(|mut task| {
            task.logs = engine.state.task_logs(&task.id);
            task
        })
        .collect())
}

pub fn task_get(engine: &Engine, project_id: &str, task_id: &str) -> Result<Task, String> {
    task_list(engine, project_id)?
        .into_iter()
        .find(|t| t.id == task_id)
        .ok_or_else(|| format!("Task {} not found", task_id))
}

pub fn task_create(engine: &Engine, project_id: &str, input: TaskInput) -> Result<Task, String> {
    // Make sure the project exists before accepting the task
    engine
        .state
        .get_project(project_id)
        .map_err(|e| e.to_string())?;

    let mut task = Task::new(input.title, input.description, input.priority);
    task.acceptance_criteria = input.acceptance_criteria;
    engine.workspace.create_task(project_id, task)
}

pub fn task_update(
    engine: &Engine,
    project_id: &str,
    task_id: &str,
    patch: TaskPatch,
) -> Result<Task, String> {
    let mut updated = None;
    engine.workspace.mutate_tasks(project_id, |file| {
        if let Some(task) = file.tasks.iter_mut().find(|t| t.id == task_id) {
            if let Some(title) = patch.title {
                task.title = title;
            }
            if let Some(description) = patch.description {
                task.description = description;
            }
            if let Some(criteria) = patch.acceptance_criteria {
                task.acceptance_criteria = criteria;
            }
            if let Some(priority) = patch.priority {
                task.priority = priority;
            }
            if let Some(status) = patch.status {
                task.status = status;
            }
            updated = Some(task.clone());
        }
    })?;
    updated.ok_or_else(|| format!("Task {} not found", task_id))
}

pub fn task_delete(engine: &Engine, project_id: &str, task_id: &str) -> Result<(), String> {
    let mut found = false;
    engine.workspace.mutate_tasks(project_id, |file| {
        let before = file.tasks.len();
        file.tasks.retain(|t| t.id != task_id);
        found = file.tasks.len() != before;
    })?;
    if found {
        Ok(())
    } else {
        Err(format!("Task {} not found", task_id))
    }
}

pub fn task_reorder(
    engine: &Engine,
    project_id: &str,
    ordered_ids: &[String],
) -> Result<Vec<Task>, String> {
    let file = engine.workspace.reorder_tasks(project_id, ordered_ids)?;
    Ok(file.tasks)
}

// ========== logs:* ==========

pub fn logs_get(engine: &Engine, task_id: &str) -> Vec<TaskLogEntry> {
    engine.state.task_logs(task_id)
}

// ========== orchestrator:* ==========

pub fn orchestrator_start(engine: &Engine, project_id: &str) -> Result<(), String> {
    engine
        .orchestrator
        .start(project_id)
        .map_err(|e| e.to_string())
}

pub fn orchestrator_stop(engine: &Engine, project_id: &str) -> Result<(), String> {
    engine
        .orchestrator
        .stop(project_id)
        .map_err(|e| e.to_string())
}

pub fn orchestrator_pause(engine: &Engine, project_id: &str) -> Result<(), String> {
    engine
        .orchestrator
        .pause(project_id)
        .map_err(|e| e.to_string())
}

pub fn orchestrator_resume(engine: &Engine, project_id: &str) -> Result<(), String> {
    engine
        .orchestrator
        .resume(project_id)
        .map_err(|e| e.to_string())
}

pub fn orchestrator_status(engine: &Engine) -> HashMap<String, RunState> {
    engine.orchestrator.status()
}

// ========== github:* ==========

pub async fn github_auth_status() -> bool {
    crate::github::auth_status().await
}

pub async fn github_login() -> Result<(), String> {
    crate::github::login().await
}

pub async fn github_list_repos() -> Result<Vec<crate::github::GithubRepo>, String> {
    crate::github::list_repos().await
}
