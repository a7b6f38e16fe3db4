//! Git operations over the git CLI.
//!
//! Every operation returns a uniform [`GitResult`]; the orchestrator decides
//! which failures are fatal. The driver never prompts: subprocesses run with
//! `GIT_TERMINAL_PROMPT=0` and pull-request creation goes through the GitHub
//! CLI (`gh`), which must already be authenticated.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::utils::repo_name_from_url;

/// Co-author trailer appended to every engine-made commit.
const AGENT_CO_AUTHOR: &str = "Co-Authored-By: Ralph Agent <agent@ralph.dev>";

/// Uniform result of a git or gh invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitResult {
    pub ok: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GitResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

pub struct GitDriver {
    workspaces_root: PathBuf,
}

impl GitDriver {
    pub fn new(workspaces_root: impl Into<PathBuf>) -> Self {
        Self {
            workspaces_root: workspaces_root.into(),
        }
    }

    /// Checkout directory for a project's repository.
    pub fn repo_dir(&self, project_id: &str, url: &str) -> PathBuf {
        self.workspaces_root
            .join(project_id)
            .join(repo_name_from_url(url))
    }

    async fn run_program(&self, program: &str, dir: Option<&Path>, args: &[&str]) -> GitResult {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        match cmd.output().await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if output.status.success() {
                    GitResult::success(stdout)
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    GitResult {
                        ok: false,
                        output: stdout,
                        error: Some(stderr),
                    }
                }
            }
            Err(e) => GitResult::failure(format!("Failed to run {}: {}", program, e)),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> GitResult {
        self.run_program("git", Some(dir), args).await
    }

    /// Clone the repository into the project workspace.
    ///
    /// If the checkout already exists with a `.git` directory, fetch instead
    /// (prune deleted remote branches). A directory without `.git` is stale
    /// debris and is removed before cloning fresh. Repeated calls converge.
    pub async fn clone_repo(&self, project_id: &str, url: &str) -> GitResult {
        let repo_dir = self.repo_dir(project_id, url);

        if repo_dir.join(".git").exists() {
            log::info!(
                "[GitDriver] Existing checkout for project {}, fetching",
                project_id
            );
            return self
                .git(&repo_dir, &["fetch", "origin", "--prune"])
                .await;
        }

        if repo_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&repo_dir) {
                return GitResult::failure(format!(
                    "Failed to clear stale workspace {:?}: {}",
                    repo_dir, e
                ));
            }
        }

        if let Some(parent) = repo_dir.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return GitResult::failure(format!(
                    "Failed to create workspace dir {:?}: {}",
                    parent, e
                ));
            }
        }

        let dest = repo_dir.to_string_lossy().to_string();
        log::info!("[GitDriver] Cloning {} for project {}", url, project_id);
        self.run_program("git", None, &["clone", url, &dest]).await
    }

    /// Check out a branch: local first, then remote-tracking, else create
    /// from HEAD.
    pub async fn checkout_or_create_branch(
        &self,
        project_id: &str,
        url: &str,
        branch: &str,
    ) -> GitResult {
        let dir = self.repo_dir(project_id, url);

        let local = self.git(&dir, &["checkout", branch]).await;
        if local.ok {
            return local;
        }

        let tracking = self
            .git(&dir, &["checkout", "--track", &format!("origin/{}", branch)])
            .await;
        if tracking.ok {
            return tracking;
        }

        self.git(&dir, &["checkout", "-b", branch]).await
    }

    /// Create the project working branch from the base branch, or resume the
    /// branch if it already exists on the remote (prior run).
    pub async fn create_working_branch(
        &self,
        project_id: &str,
        url: &str,
        working_branch: &str,
        base_branch: &str,
    ) -> GitResult {
        let dir = self.repo_dir(project_id, url);

        if self.remote_branch_exists(project_id, url, working_branch).await {
            log::info!(
                "[GitDriver] Working branch {} exists remotely, resuming",
                working_branch
            );
            let checkout = self
                .checkout_or_create_branch(project_id, url, working_branch)
                .await;
            if !checkout.ok {
                return checkout;
            }
            return self.git(&dir, &["pull", "origin", working_branch]).await;
        }

        let checkout = self
            .checkout_or_create_branch(project_id, url, base_branch)
            .await;
        if !checkout.ok {
            return checkout;
        }
        // Bring the base up to date when it has an upstream; a local-only
        // base (fresh repo) is fine.
        let pull = self.git(&dir, &["pull", "origin", base_branch]).await;
        if !pull.ok {
            log::debug!(
                "[GitDriver] Pull of base {} failed (may be local-only): {:?}",
                base_branch,
                pull.error
            );
        }

        let created = self.git(&dir, &["checkout", "-b", working_branch]).await;
        if created.ok {
            return created;
        }
        // The branch already exists locally (a run stopped before pushing)
        self.git(&dir, &["checkout", working_branch]).await
    }

    /// Stage everything and commit with the agent co-author trailer.
    /// A clean working tree is success without a commit.
    pub async fn commit(&self, project_id: &str, url: &str, message: &str) -> GitResult {
        let dir = self.repo_dir(project_id, url);

        let add = self.git(&dir, &["add", "-A"]).await;
        if !add.ok {
            return add;
        }

        let status = self.git(&dir, &["status", "--porcelain"]).await;
        if !status.ok {
            return status;
        }
        if status.output.is_empty() {
            log::debug!(
                "[GitDriver] Working tree clean for project {}, nothing to commit",
                project_id
            );
            return GitResult::success("nothing to commit");
        }

        let full_message = format!("{}\n\n{}", message, AGENT_CO_AUTHOR);
        self.git(&dir, &["commit", "-m", &full_message]).await
    }

    /// Push a branch, rebasing onto the remote first when it already exists.
    pub async fn push(&self, project_id: &str, url: &str, branch: &str) -> GitResult {
        let dir = self.repo_dir(project_id, url);

        if self.remote_branch_exists(project_id, url, branch).await {
            let rebase = self
                .git(&dir, &["pull", "--rebase", "origin", branch])
                .await;
            if !rebase.ok {
                return rebase;
            }
        }

        self.git(&dir, &["push", "-u", "origin", branch]).await
    }

    /// Probe the remote for a branch.
    pub async fn remote_branch_exists(&self, project_id: &str, url: &str, branch: &str) -> bool {
        let dir = self.repo_dir(project_id, url);
        let result = self
            .git(
                &dir,
                &["ls-remote", "--heads", "origin", &format!("refs/heads/{}", branch)],
            )
            .await;
        result.ok && !result.output.is_empty()
    }

    /// Make sure the base branch exists on the remote (a PR needs it), pushing
    /// it when missing.
    pub async fn ensure_base_branch_pushed(
        &self,
        project_id: &str,
        url: &str,
        base_branch: &str,
    ) -> GitResult {
        if self.remote_branch_exists(project_id, url, base_branch).await {
            return GitResult::success("base branch present");
        }
        let dir = self.repo_dir(project_id, url);
        log::info!(
            "[GitDriver] Base branch {} missing on remote, pushing",
            base_branch
        );
        self.git(&dir, &["push", "-u", "origin", base_branch]).await
    }

    /// Uncommitted changes relative to HEAD.
    pub async fn get_diff(&self, project_id: &str, url: &str) -> GitResult {
        let dir = self.repo_dir(project_id, url);
        self.git(&dir, &["diff", "HEAD"]).await
    }

    /// Everything the working branch adds over the base branch.
    pub async fn get_diff_from_base(
        &self,
        project_id: &str,
        url: &str,
        base_branch: &str,
    ) -> GitResult {
        let dir = self.repo_dir(project_id, url);
        self.git(&dir, &["diff", &format!("{}...HEAD", base_branch)])
            .await
    }

    pub async fn get_current_branch(&self, project_id: &str, url: &str) -> GitResult {
        let dir = self.repo_dir(project_id, url);
        self.git(&dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    /// Open a pull request through the GitHub CLI. Requires `gh` on PATH with
    /// an authenticated session.
    pub async fn create_pull_request(
        &self,
        project_id: &str,
        url: &str,
        title: &str,
        body: &str,
        base_branch: &str,
    ) -> GitResult {
        let dir = self.repo_dir(project_id, url);
        self.run_program(
            "gh",
            Some(&dir),
            &[
                "pr", "create", "--title", title, "--body", body, "--base", base_branch,
            ],
        )
        .await
    }

    /// Remove the project workspace directory.
    pub async fn cleanup_workspace(&self, project_id: &str) -> GitResult {
        let dir = self.workspaces_root.join(project_id);
        if !dir.exists() {
            return GitResult::success("workspace already removed");
        }
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => GitResult::success("workspace removed"),
            Err(e) => GitResult::failure(format!("Failed to remove workspace: {}", e)),
        }
    }
}
