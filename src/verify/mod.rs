//! Verification pipeline: detect and run the project's test suite, then ask
//! a second agent pass to review the diff against the acceptance criteria.
//!
//! The final decision is `(tests absent OR tests passed) AND review passed`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::agents::{
    build_log_key, parse_review_verdict, prompt::build_verification_prompt, AgentRunner,
    CancelToken, ProcessSpec,
};
use crate::models::Task;

/// Hard wall-clock limit for a test run.
const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Cap on captured test output.
const DEFAULT_OUTPUT_CAP: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Strict mode fails a review with no explicit verdict; lenient mode
    /// (the default) passes it.
    pub strict_review: bool,
    pub test_timeout: Duration,
    pub output_cap: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            strict_review: false,
            test_timeout: DEFAULT_TEST_TIMEOUT,
            output_cap: DEFAULT_OUTPUT_CAP,
        }
    }
}

/// A detected test runner for a working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestRunner {
    Pnpm,
    Yarn,
    Npm,
    Pytest,
    GoTest,
    CargoTest,
}

impl TestRunner {
    pub fn command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            TestRunner::Pnpm => ("pnpm", &["test"]),
            TestRunner::Yarn => ("yarn", &["test"]),
            TestRunner::Npm => ("npm", &["test"]),
            TestRunner::Pytest => ("pytest", &[]),
            TestRunner::GoTest => ("go", &["test", "./..."]),
            TestRunner::CargoTest => ("cargo", &["test"]),
        }
    }
}

/// Detect the project's test runner, in priority order.
pub fn detect_test_runner(dir: &Path) -> Option<TestRunner> {
    if let Ok(content) = std::fs::read_to_string(dir.join("package.json")) {
        if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&content) {
            let script = pkg
                .get("scripts")
                .and_then(|s| s.get("test"))
                .and_then(|t| t.as_str())
                .unwrap_or("");
            // npm init seeds a stub script that just errors out
            if !script.trim().is_empty() && !script.contains("no test specified") {
                if dir.join("pnpm-lock.yaml").exists() {
                    return Some(TestRunner::Pnpm);
                }
                if dir.join("yarn.lock").exists() {
                    return Some(TestRunner::Yarn);
                }
                return Some(TestRunner::Npm);
            }
        }
    }

    if dir.join("pytest.ini").exists() || dir.join("pyproject.toml").exists() {
        return Some(TestRunner::Pytest);
    }
    if dir.join("go.mod").exists() {
        return Some(TestRunner::GoTest);
    }
    if dir.join("Cargo.toml").exists() {
        return Some(TestRunner::CargoTest);
    }
    None
}

/// Outcome of the test step.
#[derive(Debug, Clone, Default)]
pub struct TestRunResult {
    /// Whether a test runner was found and invoked
    pub ran: bool,
    pub passed: bool,
    pub output: String,
}

/// Outcome of the self-review step.
#[derive(Debug, Clone)]
pub struct ReviewResult {
    pub passed: bool,
    pub reason: Option<String>,
    pub output: String,
}

/// Combined verification result.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub passed: bool,
    pub tests: TestRunResult,
    pub review: ReviewResult,
}

/// Inputs for verifying one task.
pub struct VerifySpec {
    pub project_id: String,
    pub task: Task,
    pub executable: String,
    pub working_directory: PathBuf,
    pub log_file_path: PathBuf,
    /// `git diff HEAD` of the task's changes
    pub diff: String,
    pub cancel: CancelToken,
}

pub struct Verifier {
    runner: Arc<AgentRunner>,
    config: VerifyConfig,
}

impl Verifier {
    pub fn new(runner: Arc<AgentRunner>, config: VerifyConfig) -> Self {
        Self { runner, config }
    }

    /// Run the full pipeline for a task the agent reported complete.
    pub async fn verify_task(&self, spec: VerifySpec) -> VerifyResult {
        let tests = self.run_detected_tests(&spec.working_directory).await;

        let test_output_for_prompt = if tests.ran {
            tests.output.as_str()
        } else {
            "(no test runner detected)"
        };
        let prompt = build_verification_prompt(&spec.task, &spec.diff, test_output_for_prompt);

        let review = self.run_review(&spec, prompt).await;

        let passed = (!tests.ran || tests.passed) && review.passed;
        log::info!(
            "[Verifier] Task {} verification: tests(ran={}, passed={}), review={}, overall={}",
            spec.task.id,
            tests.ran,
            tests.passed,
            review.passed,
            passed
        );

        VerifyResult {
            passed,
            tests,
            review,
        }
    }

    async fn run_detected_tests(&self, dir: &Path) -> TestRunResult {
        let Some(runner) = detect_test_runner(dir) else {
            log::debug!("[Verifier] No test runner detected in {:?}", dir);
            return TestRunResult::default();
        };

        let (program, args) = runner.command();
        log::info!("[Verifier] Running tests: {} {}", program, args.join(" "));
        let (passed, output) =
            run_command(dir, program, args, self.config.test_timeout, self.config.output_cap)
                .await;

        TestRunResult {
            ran: true,
            passed,
            output,
        }
    }

    async fn run_review(&self, spec: &VerifySpec, prompt: String) -> ReviewResult {
        // The reviewer only reads; editing or committing is the executor's job
        let process = ProcessSpec {
            project_id: spec.project_id.clone(),
            task_id: build_log_key(&spec.task.id, "verify"),
            executable: spec.executable.clone(),
            prompt,
            working_directory: spec.working_directory.clone(),
            log_file_path: spec.log_file_path.clone(),
            allowed_tools: vec![
                "Read".to_string(),
                "Grep".to_string(),
                "Glob".to_string(),
            ],
            disallowed_tools: vec!["Bash".to_string(), "Edit".to_string(), "Write".to_string()],
            cancel: spec.cancel.clone(),
        };

        match self.runner.run(process).await {
            Ok(outcome) if outcome.stopped => ReviewResult {
                passed: false,
                reason: Some("verification cancelled".to_string()),
                output: outcome.combined_output,
            },
            // A reviewer that dies is a failed review, not a task-blocker
            Ok(outcome) if !outcome.ok => ReviewResult {
                passed: false,
                reason: Some("verifier error".to_string()),
                output: outcome.combined_output,
            },
            Ok(outcome) => {
                let verdict =
                    parse_review_verdict(&outcome.combined_output, self.config.strict_review);
                ReviewResult {
                    passed: verdict.passed,
                    reason: verdict.reason,
                    output: outcome.combined_output,
                }
            }
            Err(e) => {
                log::warn!("[Verifier] Review subprocess failed: {}", e);
                ReviewResult {
                    passed: false,
                    reason: Some("verifier error".to_string()),
                    output: String::new(),
                }
            }
        }
    }
}

/// Run a command with a wall-clock timeout and an output cap. Returns
/// (passed, combined output).
async fn run_command(
    dir: &Path,
    program: &str,
    args: &[&str],
    timeout: Duration,
    output_cap: usize,
) -> (bool, String) {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(dir).kill_on_drop(true);

    let result = tokio::time::timeout(timeout, cmd.output()).await;
    match result {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            if combined.len() > output_cap {
                combined.truncate(output_cap);
                combined.push_str("\n[output truncated]");
            }
            (output.status.success(), combined)
        }
        Ok(Err(e)) => (false, format!("Failed to run {}: {}", program, e)),
        // Timeout: kill_on_drop reaps the child as the future is dropped
        Err(_) => (
            false,
            format!("[test run timed out after {}s]", timeout.as_secs()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_detect_node_with_lockfiles() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("package.json"),
            r#"{"scripts": {"test": "vitest run"}}"#,
        )
        .unwrap();

        assert_eq!(detect_test_runner(temp.path()), Some(TestRunner::Npm));

        std::fs::write(temp.path().join("yarn.lock"), "").unwrap();
        assert_eq!(detect_test_runner(temp.path()), Some(TestRunner::Yarn));

        // pnpm wins over yarn
        std::fs::write(temp.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(detect_test_runner(temp.path()), Some(TestRunner::Pnpm));
    }

    #[test]
    fn test_detect_skips_stub_test_script() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("package.json"),
            r#"{"scripts": {"test": "echo \"Error: no test specified\" && exit 1"}}"#,
        )
        .unwrap();
        std::fs::write(temp.path().join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();

        // Stub script is ignored; detection falls through to Cargo
        assert_eq!(detect_test_runner(temp.path()), Some(TestRunner::CargoTest));
    }

    #[test]
    fn test_detect_priority_order() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("go.mod"), "module example.com/x\n").unwrap();
        std::fs::write(temp.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(detect_test_runner(temp.path()), Some(TestRunner::GoTest));

        std::fs::write(temp.path().join("pyproject.toml"), "[project]\n").unwrap();
        assert_eq!(detect_test_runner(temp.path()), Some(TestRunner::Pytest));
    }

    #[test]
    fn test_detect_nothing() {
        let temp = TempDir::new().unwrap();
        assert_eq!(detect_test_runner(temp.path()), None);
    }

    #[tokio::test]
    async fn test_run_command_success_and_failure() {
        let temp = TempDir::new().unwrap();

        let (passed, output) = run_command(
            temp.path(),
            "sh",
            &["-c", "echo tests ok"],
            Duration::from_secs(10),
            1024,
        )
        .await;
        assert!(passed);
        assert!(output.contains("tests ok"));

        let (passed, _) = run_command(
            temp.path(),
            "sh",
            &["-c", "exit 1"],
            Duration::from_secs(10),
            1024,
        )
        .await;
        assert!(!passed);
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let temp = TempDir::new().unwrap();
        let (passed, output) = run_command(
            temp.path(),
            "sh",
            &["-c", "sleep 30"],
            Duration::from_millis(200),
            1024,
        )
        .await;
        assert!(!passed);
        assert!(output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_command_caps_output() {
        let temp = TempDir::new().unwrap();
        let (_, output) = run_command(
            temp.path(),
            "sh",
            &["-c", "yes x | head -c 4096"],
            Duration::from_secs(10),
            128,
        )
        .await;
        assert!(output.len() < 256);
        assert!(output.contains("[output truncated]"));
    }

    fn stub_reviewer(temp: &TempDir, body: &str) -> String {
        let path = temp.path().join("reviewer.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    fn verify_spec(temp: &TempDir, executable: String) -> VerifySpec {
        let workdir = temp.path().join("work");
        std::fs::create_dir_all(&workdir).unwrap();
        let mut task = Task::new("Add HELLO", "create HELLO file", 1);
        task.acceptance_criteria = vec!["Adds a file named HELLO".to_string()];
        VerifySpec {
            project_id: "p1".to_string(),
            task,
            executable,
            working_directory: workdir,
            log_file_path: temp.path().join("logs").join("t1-verify.log"),
            diff: "+hello".to_string(),
            cancel: CancelToken::new(),
        }
    }

    #[tokio::test]
    async fn test_verify_passes_without_tests() {
        let temp = TempDir::new().unwrap();
        let reviewer = stub_reviewer(&temp, "echo VERIFICATION_PASSED");
        let verifier = Verifier::new(
            Arc::new(AgentRunner::new(Arc::new(EventBus::new()))),
            VerifyConfig::default(),
        );

        let result = verifier.verify_task(verify_spec(&temp, reviewer)).await;
        assert!(result.passed);
        assert!(!result.tests.ran);
        assert!(result.review.passed);
    }

    #[tokio::test]
    async fn test_verify_fails_on_explicit_rejection() {
        let temp = TempDir::new().unwrap();
        let reviewer = stub_reviewer(&temp, "echo 'VERIFICATION_FAILED: tests missing'");
        let verifier = Verifier::new(
            Arc::new(AgentRunner::new(Arc::new(EventBus::new()))),
            VerifyConfig::default(),
        );

        let result = verifier.verify_task(verify_spec(&temp, reviewer)).await;
        assert!(!result.passed);
        assert_eq!(result.review.reason.as_deref(), Some("tests missing"));
    }

    #[tokio::test]
    async fn test_verify_lenient_accepts_hint_only_output() {
        let temp = TempDir::new().unwrap();
        let reviewer = stub_reviewer(&temp, "echo 'the change is verified'");
        let verifier = Verifier::new(
            Arc::new(AgentRunner::new(Arc::new(EventBus::new()))),
            VerifyConfig::default(),
        );

        let result = verifier.verify_task(verify_spec(&temp, reviewer)).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_verify_strict_rejects_signal_free_output() {
        let temp = TempDir::new().unwrap();
        let reviewer = stub_reviewer(&temp, "echo 'hmm not sure'");
        let verifier = Verifier::new(
            Arc::new(AgentRunner::new(Arc::new(EventBus::new()))),
            VerifyConfig {
                strict_review: true,
                ..VerifyConfig::default()
            },
        );

        let result = verifier.verify_task(verify_spec(&temp, reviewer)).await;
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_verify_subprocess_failure_is_failed_review() {
        let temp = TempDir::new().unwrap();
        let verifier = Verifier::new(
            Arc::new(AgentRunner::new(Arc::new(EventBus::new()))),
            VerifyConfig::default(),
        );

        let spec = verify_spec(&temp, "/nonexistent/agent-binary".to_string());
        let result = verifier.verify_task(spec).await;
        assert!(!result.passed);
        assert_eq!(result.review.reason.as_deref(), Some("verifier error"));
    }
}
