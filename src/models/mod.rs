// Data models matching the frontend TypeScript types

pub mod state_machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A registered remote Git repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    /// Display name (usually the bare repo name)
    pub name: String,
    /// `owner/name` as shown on the forge
    pub full_name: String,
    /// Remote URL used for clone/fetch/push
    pub url: String,
    /// Default base branch for new projects
    pub default_branch: String,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Idle => "idle",
            ProjectStatus::Running => "running",
            ProjectStatus::Paused => "paused",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work inside a Repository. Tasks are not embedded here; they live
/// in the project workspace (`.ralph/tasks.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub repository_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_brief: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_brief: Option<String>,
    /// Base branch; overrides the repository default when set at creation
    pub base_branch: String,
    /// Derived at creation: `ralph/<slug(name)>-<epoch>`
    pub working_branch: String,
    pub status: ProjectStatus,
    pub max_iterations: u32,
    #[serde(default)]
    pub current_iteration: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    Verifying,
    Done,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One agent run recorded against a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    /// Path of the raw agent transcript on disk
    pub file_path: String,
    pub summary: String,
    pub success: bool,
}

/// A discrete unit of work within a project.
///
/// The `logs` index is kept in the engine catalog, not in the workspace
/// `tasks.json` the agent consumes, so it is never serialized into the latter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Lower runs earlier; duplicates are allowed (stable order breaks ties)
    #[serde(default)]
    pub priority: i32,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifying_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing)]
    pub logs: Vec<TaskLogEntry>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>, priority: i32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            acceptance_criteria: Vec::new(),
            priority,
            status: TaskStatus::Backlog,
            attempts: 0,
            started_at: None,
            verifying_at: None,
            completed_at: None,
            logs: Vec::new(),
        }
    }
}

/// One entry of the loop log (`.ralph/logs.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopLogEntry {
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// What happened, e.g. "task_selected", "status_change", "push"
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub message: String,
}

/// The loop log file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopLogFile {
    #[serde(default)]
    pub entries: Vec<LoopLogEntry>,
}

/// Project metadata embedded in the workspace `tasks.json` so the agent can
/// orient itself without the engine catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksFileProject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_brief: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_brief: Option<String>,
}

impl From<&Project> for TasksFileProject {
    fn from(p: &Project) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            description: p.description.clone(),
            product_brief: p.product_brief.clone(),
            solution_brief: p.solution_brief.clone(),
        }
    }
}

/// The workspace `tasks.json` shape shared between engine and agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksFile {
    #[serde(default)]
    pub project: TasksFileProject,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// Engine settings (singleton, persisted inside `state.json`).
///
/// Every field carries a serde default so partially-written settings load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_max_parallel_projects")]
    pub max_parallel_projects: usize,
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,
    /// Root directory for project workspaces; `<userData>/workspaces` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspaces_path: Option<String>,
    #[serde(default = "default_agent_executable")]
    pub agent_executable: String,
}

fn default_max_parallel_projects() -> usize {
    3
}

fn default_max_task_attempts() -> u32 {
    3
}

fn default_agent_executable() -> String {
    "claude".to_string()
}

/// Default iteration ceiling for new projects.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

/// The full on-disk catalog (`state.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    #[serde(default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub settings: Settings,
    /// Per-task agent-run log index, keyed by task id
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub task_logs: HashMap<String, Vec<TaskLogEntry>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_parallel_projects: default_max_parallel_projects(),
            max_task_attempts: default_max_task_attempts(),
            workspaces_path: None,
            agent_executable: default_agent_executable(),
        }
    }
}
