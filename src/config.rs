//! Engine path resolution and settings access.
//!
//! `Settings` themselves live inside the persisted catalog (see
//! [`crate::models::Settings`]); this module resolves where engine data lives
//! on disk and applies the settings-dependent defaults.

use std::path::{Path, PathBuf};

use crate::models::Settings;

/// Resolved filesystem layout for one engine instance.
///
/// Everything hangs off a single user-data root so tests can point the whole
/// engine at a temp directory.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    user_data_dir: PathBuf,
}

impl EnginePaths {
    pub fn new(user_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            user_data_dir: user_data_dir.into(),
        }
    }

    /// Platform user-data root, e.g. `~/.local/share/ralph` on Linux.
    pub fn default_user_data() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("ralph"))
    }

    pub fn user_data_dir(&self) -> &Path {
        &self.user_data_dir
    }

    /// The persistent catalog file.
    pub fn state_file(&self) -> PathBuf {
        self.user_data_dir.join("data").join("state.json")
    }

    /// Root directory for raw agent transcripts.
    pub fn logs_dir(&self) -> PathBuf {
        self.user_data_dir.join("logs")
    }

    /// Transcript directory for one project.
    pub fn project_logs_dir(&self, project_id: &str) -> PathBuf {
        self.logs_dir().join(project_id)
    }

    /// Workspace root, honoring the `workspacesPath` setting when present.
    pub fn workspaces_dir(&self, settings: &Settings) -> PathBuf {
        match &settings.workspaces_path {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => self.user_data_dir.join("workspaces"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_file_layout() {
        let paths = EnginePaths::new("/tmp/ralph-test");
        assert_eq!(
            paths.state_file(),
            PathBuf::from("/tmp/ralph-test/data/state.json")
        );
        assert_eq!(
            paths.project_logs_dir("p1"),
            PathBuf::from("/tmp/ralph-test/logs/p1")
        );
    }

    #[test]
    fn test_workspaces_dir_honors_setting() {
        let paths = EnginePaths::new("/tmp/ralph-test");

        let defaults = Settings::default();
        assert_eq!(
            paths.workspaces_dir(&defaults),
            PathBuf::from("/tmp/ralph-test/workspaces")
        );

        let custom = Settings {
            workspaces_path: Some("/srv/workspaces".to_string()),
            ..Settings::default()
        };
        assert_eq!(
            paths.workspaces_dir(&custom),
            PathBuf::from("/srv/workspaces")
        );
    }
}
