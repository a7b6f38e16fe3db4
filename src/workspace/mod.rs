//! Per-project on-disk workspace.
//!
//! A workspace is `<workspacesRoot>/<projectId>/<repoName>/`: a Git checkout
//! plus a `.ralph/` coordination directory holding `tasks.json` (the
//! authoritative task store, read and written by both the engine and the
//! running agent) and `logs.json` (the append-only loop log).
//!
//! Write discipline: every write is atomic (temp + rename) so the two writers
//! never corrupt each other; readers see either the pre- or post-write file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::events::{EventBus, WorkspaceLogsChangedPayload, EVENT_WORKSPACE_LOGS_CHANGED};
use crate::file_storage::{atomic_write, ensure_dir, read_json_or_default, write_json, FileResult};
use crate::models::{LoopLogEntry, LoopLogFile, Project, Task, TasksFile, TasksFileProject};
use crate::utils::{lock_mutex_recover, repo_name_from_url};

/// Contents of `.ralph/.gitignore`: everything, so coordination files are
/// never committed.
const RALPH_GITIGNORE: &str = "*\n";

pub struct WorkspaceStore {
    root: PathBuf,
    events: Arc<EventBus>,
    /// Tasks created before their project workspace exists, keyed by project
    /// id. Flushed into `tasks.json` when the workspace is materialized.
    pending_tasks: Mutex<HashMap<String, Vec<Task>>>,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>, events: Arc<EventBus>) -> Self {
        Self {
            root: root.into(),
            events,
            pending_tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The per-project directory (parent of the repository checkout).
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id)
    }

    /// Deterministic repository checkout path for a remote URL.
    pub fn repo_dir(&self, project_id: &str, repo_url: &str) -> PathBuf {
        self.project_dir(project_id).join(repo_name_from_url(repo_url))
    }

    /// Find the repository checkout for a project, if one exists on disk.
    ///
    /// The project directory contains exactly one checkout, so the first
    /// subdirectory is it.
    pub fn locate_repo_dir(&self, project_id: &str) -> Option<PathBuf> {
        let dir = self.project_dir(project_id);
        let entries = fs::read_dir(&dir).ok()?;
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.is_dir())
    }

    pub fn has_workspace(&self, project_id: &str) -> bool {
        self.locate_repo_dir(project_id).is_some()
    }

    fn ralph_dir(repo_dir: &Path) -> PathBuf {
        repo_dir.join(".ralph")
    }

    fn tasks_path(repo_dir: &Path) -> PathBuf {
        Self::ralph_dir(repo_dir).join("tasks.json")
    }

    fn logs_path(repo_dir: &Path) -> PathBuf {
        Self::ralph_dir(repo_dir).join("logs.json")
    }

    /// Initialize the `.ralph/` coordination directory for a project.
    ///
    /// Idempotent: the `.gitignore` is always (re)written, but `tasks.json`
    /// and `logs.json` are only created when absent so agent-written content
    /// survives repeated calls. Tasks buffered before the workspace existed
    /// are flushed into the initial `tasks.json`.
    pub fn initialize_ralph_folder(&self, project: &Project, repo_url: &str) -> FileResult<()> {
        let repo_dir = self.repo_dir(&project.id, repo_url);
        let ralph_dir = Self::ralph_dir(&repo_dir);
        ensure_dir(&ralph_dir)?;

        atomic_write(&ralph_dir.join(".gitignore"), RALPH_GITIGNORE)?;

        let tasks_path = Self::tasks_path(&repo_dir);
        if !tasks_path.exists() {
            let tasks = self.take_pending(&project.id);
            let file = TasksFile {
                project: TasksFileProject::from(project),
                tasks,
            };
            write_json(&tasks_path, &file)?;
        } else if let Some(pending) = self.take_pending_if_any(&project.id) {
            // Workspace already had a tasks.json; append the buffered tasks.
            let mut file: TasksFile = read_json_or_default(&tasks_path)?;
            file.tasks.extend(pending);
            write_json(&tasks_path, &file)?;
        }

        let logs_path = Self::logs_path(&repo_dir);
        if !logs_path.exists() {
            write_json(&logs_path, &LoopLogFile::default())?;
        }

        log::info!(
            "[WorkspaceStore] Initialized .ralph folder for project {}",
            project.id
        );
        Ok(())
    }

    fn take_pending(&self, project_id: &str) -> Vec<Task> {
        let mut pending = lock_mutex_recover(&self.pending_tasks);
        pending.remove(project_id).unwrap_or_default()
    }

    fn take_pending_if_any(&self, project_id: &str) -> Option<Vec<Task>> {
        let mut pending = lock_mutex_recover(&self.pending_tasks);
        pending.remove(project_id).filter(|v| !v.is_empty())
    }

    /// Read the task file for a project.
    ///
    /// When no workspace exists yet, returns the in-memory buffered tasks so
    /// callers see a consistent view across the workspace lifecycle.
    pub fn read_tasks(&self, project_id: &str) -> FileResult<TasksFile> {
        match self.locate_repo_dir(project_id) {
            Some(repo_dir) => read_json_or_default(&Self::tasks_path(&repo_dir)),
            None => {
                let pending = lock_mutex_recover(&self.pending_tasks);
                Ok(TasksFile {
                    project: TasksFileProject::default(),
                    tasks: pending.get(project_id).cloned().unwrap_or_default(),
                })
            }
        }
    }

    /// Atomically replace the task file for a project.
    pub fn write_tasks(&self, project_id: &str, file: &TasksFile) -> FileResult<()> {
        let repo_dir = self
            .locate_repo_dir(project_id)
            .ok_or_else(|| format!("Workspace missing for project {}", project_id))?;
        let tasks_path = Self::tasks_path(&repo_dir);
        if let Some(parent) = tasks_path.parent() {
            ensure_dir(parent)?;
        }
        write_json(&tasks_path, file)
    }

    /// Read-modify-write on the task file. The file is re-read inside so
    /// agent writes landing between calls are observed.
    pub fn mutate_tasks<F>(&self, project_id: &str, mutate: F) -> FileResult<TasksFile>
    where
        F: FnOnce(&mut TasksFile),
    {
        let mut file = self.read_tasks(project_id)?;
        mutate(&mut file);
        self.write_tasks(project_id, &file)?;
        Ok(file)
    }

    /// Create a task. If the workspace is not materialized yet, the task is
    /// buffered in memory and becomes persistent on `initialize_ralph_folder`.
    pub fn create_task(&self, project_id: &str, task: Task) -> FileResult<Task> {
        if self.has_workspace(project_id) {
            let created = task.clone();
            self.mutate_tasks(project_id, |file| file.tasks.push(task))?;
            Ok(created)
        } else {
            let mut pending = lock_mutex_recover(&self.pending_tasks);
            pending
                .entry(project_id.to_string())
                .or_default()
                .push(task.clone());
            log::debug!(
                "[WorkspaceStore] Buffered task {} for project {} (workspace not ready)",
                task.id,
                project_id
            );
            Ok(task)
        }
    }

    /// Reassign task priorities to match the given id order. Unknown ids are
    /// ignored; tasks not listed keep their position after the listed ones.
    pub fn reorder_tasks(&self, project_id: &str, ordered_ids: &[String]) -> FileResult<TasksFile> {
        self.mutate_tasks(project_id, |file| {
            let rank: HashMap<&str, i32> = ordered_ids
                .iter()
                .enumerate()
                .map(|(i, id)| (id.as_str(), i as i32))
                .collect();
            for task in file.tasks.iter_mut() {
                if let Some(&r) = rank.get(task.id.as_str()) {
                    task.priority = r;
                }
            }
            file.tasks.sort_by_key(|t| t.priority);
        })
    }

    /// Append an entry to the loop log and notify subscribers.
    pub fn append_log(&self, project_id: &str, entry: LoopLogEntry) -> FileResult<()> {
        let repo_dir = self
            .locate_repo_dir(project_id)
            .ok_or_else(|| format!("Workspace missing for project {}", project_id))?;
        let logs_path = Self::logs_path(&repo_dir);

        let mut file: LoopLogFile = read_json_or_default(&logs_path)?;
        file.entries.push(entry);
        write_json(&logs_path, &file)?;

        self.events.emit(
            EVENT_WORKSPACE_LOGS_CHANGED,
            WorkspaceLogsChangedPayload {
                project_id: project_id.to_string(),
            },
        );
        Ok(())
    }

    pub fn read_logs(&self, project_id: &str) -> FileResult<LoopLogFile> {
        match self.locate_repo_dir(project_id) {
            Some(repo_dir) => read_json_or_default(&Self::logs_path(&repo_dir)),
            None => Ok(LoopLogFile::default()),
        }
    }

    /// Reset the loop log to empty.
    pub fn clear_logs(&self, project_id: &str) -> FileResult<()> {
        if let Some(repo_dir) = self.locate_repo_dir(project_id) {
            write_json(&Self::logs_path(&repo_dir), &LoopLogFile::default())?;
            self.events.emit(
                EVENT_WORKSPACE_LOGS_CHANGED,
                WorkspaceLogsChangedPayload {
                    project_id: project_id.to_string(),
                },
            );
        }
        Ok(())
    }

    /// Remove a project's entire workspace directory. Called on successful
    /// completion and on explicit delete.
    pub fn remove_workspace(&self, project_id: &str) -> FileResult<()> {
        let dir = self.project_dir(project_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| format!("Failed to remove workspace {:?}: {}", dir, e))?;
            log::info!("[WorkspaceStore] Removed workspace for project {}", project_id);
        }
        Ok(())
    }
}
