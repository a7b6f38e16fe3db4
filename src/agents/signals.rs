//! Completion-signal parsing for agent output.
//!
//! The contracts are line-oriented markers the prompts instruct the agent to
//! print: `TASK_COMPLETE` / `TASK_BLOCKED: <reason>` for execution passes and
//! `VERIFICATION_PASSED` / `VERIFICATION_FAILED: <reason>` for review passes.
//! Matching is case-sensitive.

use regex::Regex;
use std::sync::OnceLock;

/// Signals extracted from one execution pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentSignals {
    pub task_complete: bool,
    pub task_blocked: bool,
    pub blocked_reason: Option<String>,
}

fn task_blocked_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"TASK_BLOCKED:\s*(.+)").unwrap())
}

fn blocked_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"BLOCKED:\s*(.+)").unwrap())
}

fn verification_failed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"VERIFICATION_FAILED:\s*(.+)").unwrap())
}

/// Parse the execution-pass signals. A blocked marker dominates a complete
/// marker when both appear.
pub fn parse_agent_signals(output: &str) -> AgentSignals {
    let task_blocked = output.contains("TASK_BLOCKED") || output.contains("BLOCKED");
    let task_complete = output.contains("TASK_COMPLETE") && !task_blocked;

    let blocked_reason = if task_blocked {
        task_blocked_re()
            .captures(output)
            .or_else(|| blocked_re().captures(output))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    } else {
        None
    };

    AgentSignals {
        task_complete,
        task_blocked,
        blocked_reason,
    }
}

/// Verdict of a self-review pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewVerdict {
    pub passed: bool,
    pub reason: Option<String>,
}

/// Soft acceptance phrases used when the reviewer prints no explicit verdict.
const LENIENT_PASS_HINTS: &[&str] = &["all criteria met", "looks good", "verified"];

/// Parse the review-pass verdict.
///
/// An explicit `VERIFICATION_FAILED` always fails; an explicit
/// `VERIFICATION_PASSED` always passes. Without either marker, lenient mode
/// accepts (optionally guided by soft acceptance phrases) while strict mode
/// rejects.
pub fn parse_review_verdict(output: &str, strict: bool) -> ReviewVerdict {
    if output.contains("VERIFICATION_FAILED") {
        let reason = verification_failed_re()
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());
        return ReviewVerdict {
            passed: false,
            reason: reason.or_else(|| Some("verification failed".to_string())),
        };
    }

    if output.contains("VERIFICATION_PASSED") {
        return ReviewVerdict {
            passed: true,
            reason: None,
        };
    }

    let lower = output.to_lowercase();
    if LENIENT_PASS_HINTS.iter().any(|hint| lower.contains(hint)) {
        return ReviewVerdict {
            passed: true,
            reason: None,
        };
    }

    if strict {
        ReviewVerdict {
            passed: false,
            reason: Some("no explicit verdict in review output".to_string()),
        }
    } else {
        // No clear failure: default to passed
        ReviewVerdict {
            passed: true,
            reason: None,
        }
    }
}
