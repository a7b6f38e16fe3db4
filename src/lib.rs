#![allow(clippy::too_many_arguments)] // Command handlers often need many params
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types

// Module declarations
pub mod agents;
pub mod commands;
pub mod config;
pub mod events;
mod file_storage;
pub mod git;
pub mod github;
pub mod models;
pub mod orchestrator;
pub mod state;
pub mod utils;
pub mod verify;
pub mod workspace;

pub use file_storage::FileResult;
pub use utils::as_path;

use std::sync::Arc;

use agents::AgentRunner;
use config::EnginePaths;
use events::EventBus;
use git::GitDriver;
use orchestrator::Orchestrator;
use state::StateManager;
use verify::{Verifier, VerifyConfig};
use workspace::WorkspaceStore;

/// The engine container: every component built once at startup and handed to
/// its collaborators explicitly. Tests construct isolated engines by pointing
/// [`EnginePaths`] at a temp directory.
pub struct Engine {
    pub paths: EnginePaths,
    pub events: Arc<EventBus>,
    pub state: Arc<StateManager>,
    pub workspace: Arc<WorkspaceStore>,
    pub git: Arc<GitDriver>,
    pub runner: Arc<AgentRunner>,
    pub verifier: Arc<Verifier>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Engine {
    pub fn new(paths: EnginePaths) -> Self {
        Self::with_verify_config(paths, VerifyConfig::default())
    }

    pub fn with_verify_config(paths: EnginePaths, verify_config: VerifyConfig) -> Self {
        let events = Arc::new(EventBus::new());
        let state = StateManager::new(&paths, Arc::clone(&events));

        let workspaces_root = paths.workspaces_dir(&state.settings());
        let workspace = Arc::new(WorkspaceStore::new(
            workspaces_root.clone(),
            Arc::clone(&events),
        ));
        let git = Arc::new(GitDriver::new(workspaces_root));
        let runner = Arc::new(AgentRunner::new(Arc::clone(&events)));
        let verifier = Arc::new(Verifier::new(Arc::clone(&runner), verify_config));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&state),
            Arc::clone(&workspace),
            Arc::clone(&git),
            Arc::clone(&runner),
            Arc::clone(&verifier),
            Arc::clone(&events),
            paths.clone(),
        ));

        Self {
            paths,
            events,
            state,
            workspace,
            git,
            runner,
            verifier,
            orchestrator,
        }
    }

    /// Start the background tasks (debounced persistence, state-file watch).
    /// Requires a Tokio runtime.
    pub fn start_background(&self) {
        self.state.spawn_background();
        log::info!("[Engine] Background tasks started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_engine_construction_is_isolated() {
        let temp_a = TempDir::new().unwrap();
        let temp_b = TempDir::new().unwrap();

        let engine_a = Engine::new(EnginePaths::new(temp_a.path()));
        let engine_b = Engine::new(EnginePaths::new(temp_b.path()));

        engine_a
            .state
            .create_repository(state::RepositoryInput {
                name: "demo".to_string(),
                full_name: "acme/demo".to_string(),
                url: "https://github.com/acme/demo.git".to_string(),
                default_branch: None,
                is_private: false,
            })
            .unwrap();

        assert_eq!(engine_a.state.get_state().repositories.len(), 1);
        assert!(engine_b.state.get_state().repositories.is_empty());
    }
}
