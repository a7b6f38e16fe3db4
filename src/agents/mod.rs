// Agent subprocess lifecycle: spawning, output capture, signal parsing

mod log_file;
pub mod prompt;
mod runner;
pub mod signals;

pub use log_file::{build_log_key, task_log_path, TaskLogFile};
pub use runner::{AgentOutcome, AgentRunner, ProcessSpec};
pub use signals::{parse_agent_signals, parse_review_verdict, AgentSignals, ReviewVerdict};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cooperative cancellation token threaded from the orchestrator down to the
/// agent subprocess.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. Idempotent; wakes every waiter.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is tripped.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before re-checking so a cancel() landing
            // between the check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Tools the agent may use without prompting: read/search/edit plus the safe
/// local shell subset (staging, committing, running tests).
pub fn default_allowed_tools() -> Vec<String> {
    [
        "Read",
        "Edit",
        "Write",
        "Grep",
        "Glob",
        "Bash(git add:*)",
        "Bash(git commit:*)",
        "Bash(git status:*)",
        "Bash(git diff:*)",
        "Bash(npm test:*)",
        "Bash(pnpm test:*)",
        "Bash(yarn test:*)",
        "Bash(pytest:*)",
        "Bash(go test:*)",
        "Bash(cargo test:*)",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Remote-facing operations stay with the engine, never the agent.
pub fn default_disallowed_tools() -> Vec<String> {
    ["Bash(git push:*)", "Bash(gh:*)"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_token_wakes_waiter() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let woke = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(woke);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_before_wait_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("pre-cancelled token must resolve immediately");
    }

    #[test]
    fn test_default_tool_lists() {
        let allowed = default_allowed_tools();
        assert!(allowed.iter().any(|t| t == "Read"));
        assert!(allowed.iter().any(|t| t.starts_with("Bash(git commit")));

        let disallowed = default_disallowed_tools();
        assert!(disallowed.iter().any(|t| t.starts_with("Bash(git push")));
        assert!(disallowed.iter().any(|t| t.starts_with("Bash(gh")));
    }
}
