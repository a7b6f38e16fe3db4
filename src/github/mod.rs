//! GitHub account integration through the `gh` CLI.
//!
//! Authentication is delegated entirely to `gh auth login`; the engine never
//! touches tokens. Repository enumeration shells out to `gh api` and parses
//! its newline-delimited JSON output.

use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// One repository the authenticated user can access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubRepo {
    pub name: String,
    pub name_with_owner: String,
    pub url: String,
    pub owner: GithubOwner,
    pub is_private: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubOwner {
    pub login: String,
}

/// `gh api` jq projection mapping the REST repo shape onto [`GithubRepo`].
const REPO_QUERY: &str = ".[] | {name, nameWithOwner: .full_name, url: .html_url, owner: {login: .owner.login}, isPrivate: .private}";

/// Whether a `gh` session is authenticated against github.com.
pub async fn auth_status() -> bool {
    Command::new("gh")
        .args(["auth", "status", "-h", "github.com"])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Start the browser-based login flow. The subprocess owns the interaction;
/// we only report whether it exited cleanly.
pub async fn login() -> Result<(), String> {
    let status = Command::new("gh")
        .args(["auth", "login", "--web"])
        .status()
        .await
        .map_err(|e| format!("Failed to run gh: {}", e))?;

    if status.success() {
        Ok(())
    } else {
        Err("gh auth login failed".to_string())
    }
}

/// Enumerate the user's repositories, sorted by `nameWithOwner`.
pub async fn list_repos() -> Result<Vec<GithubRepo>, String> {
    let output = Command::new("gh")
        .args(["api", "/user/repos", "--paginate", "-q", REPO_QUERY])
        .output()
        .await
        .map_err(|e| format!("Failed to run gh: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(format!("gh api failed: {}", stderr));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut repos = parse_repo_lines(&stdout)?;
    repos.sort_by(|a, b| a.name_with_owner.cmp(&b.name_with_owner));
    Ok(repos)
}

/// Parse newline-delimited JSON repo objects, skipping blank lines.
fn parse_repo_lines(output: &str) -> Result<Vec<GithubRepo>, String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<GithubRepo>(line)
                .map_err(|e| format!("Failed to parse gh output line: {}", e))
        })
        .collect()
}
