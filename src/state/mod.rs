//! Persistent engine catalog (`state.json`).
//!
//! The manager is the single writer of the catalog file. All mutations go
//! through [`StateManager::mutate`], which updates the in-memory state,
//! notifies subscribers, and schedules a debounced persist so bursts of
//! writes collapse into one disk write. The file is also watched for
//! external modification: anything byte-different from the last written
//! content is reloaded and republished.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::EnginePaths;
use crate::events::{EventBus, EVENT_STATE_CHANGED};
use crate::file_storage::{atomic_write, ensure_dir};
use crate::models::{
    AppState, Project, ProjectStatus, Repository, Settings, TaskLogEntry, DEFAULT_MAX_ITERATIONS,
};
use crate::utils::{lock_mutex_recover, slugify};

/// Debounce window for coalescing persists.
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(100);

/// Poll interval for external-mutation detection.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Repository {0} still has dependent projects")]
    HasDependents(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Input for creating a repository record.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInput {
    pub name: String,
    pub full_name: String,
    pub url: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

/// Input for creating a project.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInput {
    pub repository_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub product_brief: Option<String>,
    #[serde(default)]
    pub solution_brief: Option<String>,
    /// Overrides the repository default branch when set
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

/// Partial update for a project; `None` fields are left untouched.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub product_brief: Option<String>,
    #[serde(default)]
    pub solution_brief: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub status: Option<ProjectStatus>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub current_iteration: Option<u32>,
}

/// Partial update for settings.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default)]
    pub max_parallel_projects: Option<usize>,
    #[serde(default)]
    pub max_task_attempts: Option<u32>,
    #[serde(default)]
    pub workspaces_path: Option<String>,
    #[serde(default)]
    pub agent_executable: Option<String>,
}

pub struct StateManager {
    path: PathBuf,
    inner: Mutex<AppState>,
    /// Exact content of the last write we made, for external-change detection
    last_written: Mutex<Option<String>>,
    snapshot_tx: watch::Sender<AppState>,
    persist_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    events: Arc<EventBus>,
}

impl StateManager {
    /// Load (and lazily migrate) the catalog from disk.
    pub fn new(paths: &EnginePaths, events: Arc<EventBus>) -> Arc<Self> {
        let path = paths.state_file();
        let (state, migrated) = load_state(&path);
        let serialized = serde_json::to_string_pretty(&state).ok();

        let (snapshot_tx, _) = watch::channel(state.clone());
        let manager = Arc::new(Self {
            path,
            inner: Mutex::new(state),
            last_written: Mutex::new(serialized),
            snapshot_tx,
            persist_tx: Mutex::new(None),
            events,
        });

        if migrated {
            if let Err(e) = manager.persist_now() {
                log::error!("[StateManager] Failed to persist migrated state: {}", e);
            }
        }

        manager
    }

    /// Spawn the debounced-persist and external-watch background tasks.
    /// Requires a Tokio runtime; called once by the engine at startup.
    pub fn spawn_background(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        *lock_mutex_recover(&self.persist_tx) = Some(tx);

        let persist_me = Arc::clone(self);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(PERSIST_DEBOUNCE).await;
                // Coalesce everything that arrived during the window
                while rx.try_recv().is_ok() {}
                if let Err(e) = persist_me.persist_now() {
                    log::error!("[StateManager] Persist failed: {}", e);
                }
            }
        });

        let watch_me = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                watch_me.check_external_change();
            }
        });
    }

    /// Consistent copy of the current catalog.
    pub fn get_state(&self) -> AppState {
        lock_mutex_recover(&self.inner).clone()
    }

    pub fn settings(&self) -> Settings {
        lock_mutex_recover(&self.inner).settings.clone()
    }

    /// Subscribe to catalog snapshots. The channel coalesces: a slow consumer
    /// sees the latest snapshot, not every intermediate one.
    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.snapshot_tx.subscribe()
    }

    /// Apply a mutation, publish the new snapshot, and schedule a persist.
    fn mutate<T>(&self, f: impl FnOnce(&mut AppState) -> Result<T, StateError>) -> Result<T, StateError> {
        let (result, snapshot) = {
            let mut state = lock_mutex_recover(&self.inner);
            let result = f(&mut state)?;
            (result, state.clone())
        };

        let _ = self.snapshot_tx.send(snapshot);

        let scheduled = {
            let tx = lock_mutex_recover(&self.persist_tx);
            tx.as_ref().map(|tx| tx.send(()).is_ok()).unwrap_or(false)
        };
        if !scheduled {
            // No background task (tests, shutdown): write through synchronously
            self.persist_now().map_err(StateError::Storage)?;
        }

        Ok(result)
    }

    /// Write the current state to disk and remember the exact bytes.
    pub fn persist_now(&self) -> Result<(), String> {
        let content = {
            let state = lock_mutex_recover(&self.inner);
            serde_json::to_string_pretty(&*state)
                .map_err(|e| format!("Failed to serialize state: {}", e))?
        };

        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        atomic_write(&self.path, &content)?;
        *lock_mutex_recover(&self.last_written) = Some(content);

        self.events.emit(EVENT_STATE_CHANGED, self.get_state());
        Ok(())
    }

    /// Compare the on-disk file against our last write; reload on mismatch.
    /// Returns true when an external change was picked up.
    pub fn check_external_change(&self) -> bool {
        let on_disk = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return false,
        };

        {
            let last = lock_mutex_recover(&self.last_written);
            if last.as_deref() == Some(on_disk.as_str()) {
                return false;
            }
        }

        log::info!("[StateManager] External modification of state.json detected, reloading");
        let (state, _) = parse_state(&on_disk);
        let snapshot = state.clone();
        *lock_mutex_recover(&self.inner) = state;
        *lock_mutex_recover(&self.last_written) = Some(on_disk);

        let _ = self.snapshot_tx.send(snapshot);
        self.events.emit(EVENT_STATE_CHANGED, self.get_state());
        true
    }

    // ========== Repositories ==========

    pub fn create_repository(&self, input: RepositoryInput) -> Result<Repository, StateError> {
        self.mutate(|state| {
            let now = Utc::now();
            let repo = Repository {
                id: uuid::Uuid::new_v4().to_string(),
                name: input.name.clone(),
                full_name: input.full_name.clone(),
                url: input.url.clone(),
                default_branch: input.default_branch.clone().unwrap_or_else(|| "main".to_string()),
                is_private: input.is_private,
                created_at: now,
                updated_at: now,
            };
            state.repositories.push(repo.clone());
            Ok(repo)
        })
    }

    pub fn delete_repository(&self, id: &str) -> Result<(), StateError> {
        self.mutate(|state| {
            if !state.repositories.iter().any(|r| r.id == id) {
                return Err(StateError::NotFound(format!("repository {}", id)));
            }
            if state.projects.iter().any(|p| p.repository_id == id) {
                return Err(StateError::HasDependents(id.to_string()));
            }
            state.repositories.retain(|r| r.id != id);
            Ok(())
        })
    }

    pub fn get_repository(&self, id: &str) -> Result<Repository, StateError> {
        let state = lock_mutex_recover(&self.inner);
        state
            .repositories
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("repository {}", id)))
    }

    pub fn repository_for_project(&self, project_id: &str) -> Result<Repository, StateError> {
        let state = lock_mutex_recover(&self.inner);
        let project = state
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .ok_or_else(|| StateError::NotFound(format!("project {}", project_id)))?;
        state
            .repositories
            .iter()
            .find(|r| r.id == project.repository_id)
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("repository {}", project.repository_id)))
    }

    // ========== Projects ==========

    pub fn create_project(&self, input: ProjectInput) -> Result<Project, StateError> {
        self.mutate(|state| {
            let repo = state
                .repositories
                .iter()
                .find(|r| r.id == input.repository_id)
                .ok_or_else(|| StateError::NotFound(format!("repository {}", input.repository_id)))?;

            let now = Utc::now();
            let base_branch = input
                .base_branch
                .clone()
                .unwrap_or_else(|| repo.default_branch.clone());
            let working_branch =
                format!("ralph/{}-{}", slugify(&input.name), now.timestamp());

            let project = Project {
                id: uuid::Uuid::new_v4().to_string(),
                repository_id: input.repository_id.clone(),
                name: input.name.clone(),
                description: input.description.clone(),
                product_brief: input.product_brief.clone(),
                solution_brief: input.solution_brief.clone(),
                base_branch,
                working_branch,
                status: ProjectStatus::Idle,
                max_iterations: input.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
                current_iteration: 0,
                created_at: now,
                updated_at: now,
            };
            state.projects.push(project.clone());
            Ok(project)
        })
    }

    pub fn get_project(&self, id: &str) -> Result<Project, StateError> {
        let state = lock_mutex_recover(&self.inner);
        state
            .projects
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("project {}", id)))
    }

    pub fn update_project(&self, id: &str, patch: ProjectPatch) -> Result<Project, StateError> {
        self.mutate(|state| {
            let project = state
                .projects
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| StateError::NotFound(format!("project {}", id)))?;

            if let Some(name) = patch.name {
                project.name = name;
            }
            if let Some(description) = patch.description {
                project.description = description;
            }
            if let Some(brief) = patch.product_brief {
                project.product_brief = Some(brief);
            }
            if let Some(brief) = patch.solution_brief {
                project.solution_brief = Some(brief);
            }
            if let Some(base) = patch.base_branch {
                project.base_branch = base;
            }
            if let Some(status) = patch.status {
                project.status = status;
            }
            if let Some(max) = patch.max_iterations {
                project.max_iterations = max;
            }
            if let Some(iter) = patch.current_iteration {
                project.current_iteration = iter;
            }
            project.updated_at = Utc::now();
            Ok(project.clone())
        })
    }

    pub fn set_project_status(&self, id: &str, status: ProjectStatus) -> Result<Project, StateError> {
        self.update_project(
            id,
            ProjectPatch {
                status: Some(status),
                ..ProjectPatch::default()
            },
        )
    }

    pub fn delete_project(&self, id: &str) -> Result<(), StateError> {
        self.mutate(|state| {
            if !state.projects.iter().any(|p| p.id == id) {
                return Err(StateError::NotFound(format!("project {}", id)));
            }
            state.projects.retain(|p| p.id != id);
            Ok(())
        })
    }

    // ========== Settings ==========

    pub fn update_settings(&self, patch: SettingsPatch) -> Result<Settings, StateError> {
        self.mutate(|state| {
            if let Some(v) = patch.max_parallel_projects {
                state.settings.max_parallel_projects = v;
            }
            if let Some(v) = patch.max_task_attempts {
                state.settings.max_task_attempts = v;
            }
            if let Some(v) = patch.workspaces_path {
                state.settings.workspaces_path = if v.is_empty() { None } else { Some(v) };
            }
            if let Some(v) = patch.agent_executable {
                state.settings.agent_executable = v;
            }
            Ok(state.settings.clone())
        })
    }

    // ========== Task log index ==========

    pub fn append_task_log(&self, task_id: &str, entry: TaskLogEntry) -> Result<(), StateError> {
        self.mutate(|state| {
            state
                .task_logs
                .entry(task_id.to_string())
                .or_default()
                .push(entry);
            Ok(())
        })
    }

    pub fn task_logs(&self, task_id: &str) -> Vec<TaskLogEntry> {
        let state = lock_mutex_recover(&self.inner);
        state.task_logs.get(task_id).cloned().unwrap_or_default()
    }
}

/// Load the catalog, applying the legacy migration. Returns the state and
/// whether a migration rewrote it.
fn load_state(path: &PathBuf) -> (AppState, bool) {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return (AppState::default(), false);
        }
        Err(e) => {
            log::warn!("[StateManager] Failed to read state file: {}; starting empty", e);
            return (AppState::default(), false);
        }
    };
    parse_state(&content)
}

fn parse_state(content: &str) -> (AppState, bool) {
    let mut value: serde_json::Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("[StateManager] Failed to parse state file: {}; starting empty", e);
            return (AppState::default(), false);
        }
    };

    let migrated = migrate_legacy_repo_urls(&mut value);

    match serde_json::from_value::<AppState>(value) {
        Ok(state) => (state, migrated),
        Err(e) => {
            log::warn!("[StateManager] State file has invalid schema: {}; starting empty", e);
            (AppState::default(), false)
        }
    }
}

/// Legacy catalogs embedded `repoUrl` directly on each project. Synthesize a
/// Repository per distinct URL and rewrite projects to reference it.
fn migrate_legacy_repo_urls(value: &mut serde_json::Value) -> bool {
    let mut changed = false;
    let mut synthesized: Vec<(String, serde_json::Value)> = Vec::new();

    if let Some(projects) = value.get_mut("projects").and_then(|p| p.as_array_mut()) {
        for project in projects.iter_mut() {
            let Some(url) = project
                .get("repoUrl")
                .and_then(|u| u.as_str())
                .map(|s| s.to_string())
            else {
                continue;
            };

            let repo_id = match synthesized.iter().find(|(u, _)| *u == url) {
                Some((_, repo)) => repo["id"].as_str().unwrap_or_default().to_string(),
                None => {
                    let (owner, name) = parse_owner_repo(&url)
                        .unwrap_or_else(|| ("unknown".to_string(), crate::utils::repo_name_from_url(&url)));
                    let id = uuid::Uuid::new_v4().to_string();
                    let now = Utc::now();
                    let repo = serde_json::json!({
                        "id": id,
                        "name": name,
                        "fullName": format!("{}/{}", owner, name),
                        "url": url,
                        "defaultBranch": "main",
                        "isPrivate": false,
                        "createdAt": now,
                        "updatedAt": now,
                    });
                    synthesized.push((url.clone(), repo));
                    id
                }
            };

            if let Some(obj) = project.as_object_mut() {
                obj.remove("repoUrl");
                obj.insert("repositoryId".to_string(), serde_json::json!(repo_id));
            }
            changed = true;
        }
    }

    if !synthesized.is_empty() {
        let repositories = value
            .as_object_mut()
            .and_then(|o| {
                o.entry("repositories")
                    .or_insert_with(|| serde_json::json!([]))
                    .as_array_mut()
            });
        if let Some(repositories) = repositories {
            for (_, repo) in synthesized {
                repositories.push(repo);
            }
        }
    }

    changed
}

/// Parse `owner/name` out of a GitHub remote URL
/// (`github.com[:/]<owner>/<name>(.git)?`).
pub fn parse_owner_repo(url: &str) -> Option<(String, String)> {
    let idx = url.find("github.com")?;
    let rest = &url[idx + "github.com".len()..];
    let sep = rest.chars().next()?;
    if sep != ':' && sep != '/' {
        return None;
    }
    let rest = &rest[1..];
    let mut parts = rest.splitn(2, '/');
    let owner = parts.next()?.to_string();
    let name = parts
        .next()?
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .to_string();
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some((owner, name))
}
