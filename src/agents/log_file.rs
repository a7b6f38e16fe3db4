//! Raw agent transcripts on disk.
//!
//! One UTF-8 file per run at `<userData>/logs/<projectId>/<taskId>-<ts>.log`,
//! framed by a header (start time, ids, working directory, prompt) and a
//! footer (exit description, end time). The file is append-only while the
//! run is live; parsing always happens on the in-memory transcript, never on
//! this file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::file_storage::ensure_dir;

/// Log key for a derived pass over a task, e.g. `<taskId>-verify`.
pub fn build_log_key(task_id: &str, suffix: &str) -> String {
    format!("{}-{}", task_id, suffix)
}

/// Compute the transcript path for a run starting now.
pub fn task_log_path(project_logs_dir: &Path, task_key: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
    project_logs_dir.join(format!("{}-{}.log", task_key, stamp))
}

pub struct TaskLogFile {
    path: PathBuf,
    file: File,
}

impl TaskLogFile {
    /// Create the file and write the run header.
    pub fn create(
        path: PathBuf,
        project_id: &str,
        task_key: &str,
        working_dir: &Path,
        prompt: &str,
    ) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("Failed to open log file {:?}: {}", path, e))?;

        let header = format!(
            "=== Agent run ===\nStarted: {}\nProject: {}\nTask: {}\nWorking directory: {}\n--- Prompt ---\n{}\n--- Output ---\n",
            Utc::now().to_rfc3339(),
            project_id,
            task_key,
            working_dir.display(),
            prompt,
        );
        file.write_all(header.as_bytes())
            .map_err(|e| format!("Failed to write log header: {}", e))?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_chunk(&mut self, chunk: &[u8]) {
        if let Err(e) = self.file.write_all(chunk) {
            log::warn!("[TaskLogFile] Failed to append chunk: {}", e);
        }
    }

    /// Write the footer and close the file.
    pub fn finish(mut self, exit_description: &str) {
        let footer = format!(
            "\n--- End ---\nExit: {}\nEnded: {}\n",
            exit_description,
            Utc::now().to_rfc3339(),
        );
        if let Err(e) = self.file.write_all(footer.as_bytes()) {
            log::warn!("[TaskLogFile] Failed to write log footer: {}", e);
        }
    }
}
