//! End-to-end orchestration scenarios against real git remotes (local bare
//! repositories) and stub agent executables.
//!
//! The stubs are shell scripts standing in for the agent CLI: they receive
//! the prompt as `-p <prompt>` and answer with the engine's line signals.
//! A stub `gh` on PATH records pull-request invocations.

use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use ralph_engine::commands;
use ralph_engine::config::EnginePaths;
use ralph_engine::models::{ProjectStatus, TaskStatus};
use ralph_engine::state::{ProjectInput, RepositoryInput, SettingsPatch};
use ralph_engine::Engine;

/// Directory holding the stub `gh` plus its invocation log, created once per
/// test process and prepended to PATH.
fn stub_bin_dir() -> &'static PathBuf {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = std::env::temp_dir().join(format!("ralph-engine-stubs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let gh = dir.join("gh");
        std::fs::write(
            &gh,
            format!(
                "#!/bin/sh\necho \"$PWD $*\" >> {}\necho 'https://github.com/acme/demo/pull/1'\n",
                dir.join("gh_calls.log").display()
            ),
        )
        .unwrap();
        make_executable(&gh);

        let path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", dir.display(), path));

        // Commits made by the engine need an identity regardless of the
        // host's git configuration
        std::env::set_var("GIT_AUTHOR_NAME", "Ralph Test");
        std::env::set_var("GIT_AUTHOR_EMAIL", "test@ralph.dev");
        std::env::set_var("GIT_COMMITTER_NAME", "Ralph Test");
        std::env::set_var("GIT_COMMITTER_EMAIL", "test@ralph.dev");

        dir
    })
}

fn gh_calls() -> String {
    std::fs::read_to_string(stub_bin_dir().join("gh_calls.log")).unwrap_or_default()
}

fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

/// Create a bare "remote" with one commit on `main`; returns its path-URL.
fn init_remote(temp: &TempDir) -> String {
    let remote = temp.path().join("remote.git");
    let seed = temp.path().join("seed");

    run_git(temp.path(), &["init", "--bare", "-b", "main", remote.to_str().unwrap()]);
    run_git(temp.path(), &["clone", remote.to_str().unwrap(), seed.to_str().unwrap()]);
    std::fs::write(seed.join("README.md"), "# seed\n").unwrap();
    run_git(&seed, &["add", "-A"]);
    run_git(&seed, &["commit", "-m", "initial"]);
    run_git(&seed, &["push", "-u", "origin", "main"]);

    remote.to_string_lossy().to_string()
}

fn run_git(dir: &Path, args: &[&str]) {
    let output = StdCommand::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let output = StdCommand::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Write a stub agent. `$1` is `-p`, `$2` the prompt; verification prompts
/// are recognized by their "Verdict" section.
fn write_agent(temp: &TempDir, name: &str, body: &str) -> String {
    let path = temp.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    make_executable(&path);
    path.to_string_lossy().to_string()
}

struct Harness {
    engine: Engine,
    project_id: String,
    remote_url: String,
}

fn build_harness(
    temp: &TempDir,
    agent: &str,
    max_task_attempts: u32,
    max_parallel: usize,
) -> Harness {
    stub_bin_dir();

    let remote_url = init_remote(temp);
    let engine = Engine::new(EnginePaths::new(temp.path().join("userdata")));
    engine
        .state
        .update_settings(SettingsPatch {
            max_parallel_projects: Some(max_parallel),
            max_task_attempts: Some(max_task_attempts),
            agent_executable: Some(agent.to_string()),
            ..SettingsPatch::default()
        })
        .unwrap();

    let repo = engine
        .state
        .create_repository(RepositoryInput {
            name: "remote".to_string(),
            full_name: "acme/remote".to_string(),
            url: remote_url.clone(),
            default_branch: Some("main".to_string()),
            is_private: false,
        })
        .unwrap();
    let project = engine
        .state
        .create_project(ProjectInput {
            repository_id: repo.id,
            name: "Demo Flow".to_string(),
            description: "engine integration scenario".to_string(),
            product_brief: None,
            solution_brief: None,
            base_branch: None,
            max_iterations: None,
        })
        .unwrap();

    Harness {
        engine,
        project_id: project.id,
        remote_url,
    }
}

fn add_task(harness: &Harness, title: &str, criteria: &[&str], priority: i32) -> String {
    commands::task_create(
        &harness.engine,
        &harness.project_id,
        commands::TaskInput {
            title: title.to_string(),
            description: format!("Task: {}", title),
            acceptance_criteria: criteria.iter().map(|c| c.to_string()).collect(),
            priority,
        },
    )
    .unwrap()
    .id
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

fn project_status(harness: &Harness) -> ProjectStatus {
    harness
        .engine
        .state
        .get_project(&harness.project_id)
        .unwrap()
        .status
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_one_task_ends_completed_with_pr() {
    let temp = TempDir::new().unwrap();
    let agent = write_agent(
        &temp,
        "agent.sh",
        r#"case "$2" in
  *Verdict*) echo VERIFICATION_PASSED;;
  *) echo hello > HELLO; echo TASK_COMPLETE;;
esac"#,
    );
    let harness = build_harness(&temp, &agent, 3, 1);
    let task_id = add_task(&harness, "Add HELLO", &["Adds a file named HELLO"], 1);

    harness.engine.orchestrator.start(&harness.project_id).unwrap();

    let done = wait_until(Duration::from_secs(60), || {
        matches!(
            project_status(&harness),
            ProjectStatus::Completed | ProjectStatus::Failed
        )
    })
    .await;
    assert!(done, "project did not reach a terminal state");
    assert_eq!(project_status(&harness), ProjectStatus::Completed);

    // Task ended done on the first attempt
    let logs = commands::logs_get(&harness.engine, &task_id);
    assert_eq!(logs.len(), 1);
    assert!(logs[0].success);

    // Exactly one commit landed on the pushed working branch
    let project = harness.engine.state.get_project(&harness.project_id).unwrap();
    let check = temp.path().join("check");
    run_git(temp.path(), &["clone", &harness.remote_url, check.to_str().unwrap()]);
    run_git(&check, &["checkout", &project.working_branch]);
    let count = git_stdout(&check, &["rev-list", "--count", "main..HEAD"]);
    assert_eq!(count, "1");
    assert!(check.join("HELLO").exists());

    // The PR was opened from the project workspace
    assert!(gh_calls().contains(&harness.project_id));

    // Workspace removed on success
    assert!(!harness.engine.workspace.has_workspace(&harness.project_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn blocked_task_exhausts_attempts_and_fails_project() {
    let temp = TempDir::new().unwrap();
    let agent = write_agent(
        &temp,
        "agent.sh",
        r#"echo 'TASK_BLOCKED: missing credential'"#,
    );
    let harness = build_harness(&temp, &agent, 3, 1);
    let task_id = add_task(&harness, "Impossible", &["cannot happen"], 1);

    harness.engine.orchestrator.start(&harness.project_id).unwrap();

    let done = wait_until(Duration::from_secs(60), || {
        matches!(
            project_status(&harness),
            ProjectStatus::Completed | ProjectStatus::Failed
        )
    })
    .await;
    assert!(done, "project did not reach a terminal state");

    // No done tasks + one blocked task => failed
    assert_eq!(project_status(&harness), ProjectStatus::Failed);

    // Three attempts, all recorded as failures
    let logs = commands::logs_get(&harness.engine, &task_id);
    assert_eq!(logs.len(), 3);
    assert!(logs.iter().all(|l| !l.success));
    assert!(logs[0].summary.contains("missing credential"));

    // No PR was opened for this project
    assert!(!gh_calls().contains(&harness.project_id));

    // Workspace removed
    assert!(!harness.engine.workspace.has_workspace(&harness.project_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn verification_flap_then_pass_takes_two_attempts() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("verify-attempted");
    let agent = write_agent(
        &temp,
        "agent.sh",
        &format!(
            r#"case "$2" in
  *Verdict*)
    if [ -f "{marker}" ]; then echo VERIFICATION_PASSED
    else touch "{marker}"; echo 'VERIFICATION_FAILED: tests missing'; fi;;
  *) echo hello > HELLO; echo TASK_COMPLETE;;
esac"#,
            marker = marker.display()
        ),
    );
    let harness = build_harness(&temp, &agent, 3, 1);
    let task_id = add_task(&harness, "Add HELLO", &["Adds a file named HELLO"], 1);

    harness.engine.orchestrator.start(&harness.project_id).unwrap();

    let done = wait_until(Duration::from_secs(90), || {
        matches!(
            project_status(&harness),
            ProjectStatus::Completed | ProjectStatus::Failed
        )
    })
    .await;
    assert!(done, "project did not reach a terminal state");
    assert_eq!(project_status(&harness), ProjectStatus::Completed);

    // First attempt failed review, second passed
    let logs = commands::logs_get(&harness.engine, &task_id);
    assert_eq!(logs.len(), 2);
    assert!(!logs[0].success);
    assert!(logs[0].summary.contains("tests missing"));
    assert!(logs[1].success);

    // Exactly one commit despite two attempts
    let project = harness.engine.state.get_project(&harness.project_id).unwrap();
    let check = temp.path().join("check");
    run_git(temp.path(), &["clone", &harness.remote_url, check.to_str().unwrap()]);
    run_git(&check, &["checkout", &project.working_branch]);
    assert_eq!(git_stdout(&check, &["rev-list", "--count", "main..HEAD"]), "1");
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_during_execution_reverts_task_and_idles_project() {
    let temp = TempDir::new().unwrap();
    let agent = write_agent(&temp, "agent.sh", "echo started\nsleep 30\necho TASK_COMPLETE");
    let harness = build_harness(&temp, &agent, 3, 1);
    add_task(&harness, "Long runner", &["never finishes"], 1);

    harness.engine.orchestrator.start(&harness.project_id).unwrap();

    // Wait until the agent is actually executing the task
    let executing = wait_until(Duration::from_secs(30), || {
        harness
            .engine
            .orchestrator
            .status()
            .get(&harness.project_id)
            .map(|s| s.current_task_id.is_some())
            .unwrap_or(false)
    })
    .await;
    assert!(executing, "task never started executing");

    let stop_started = Instant::now();
    harness.engine.orchestrator.stop(&harness.project_id).unwrap();

    assert_eq!(project_status(&harness), ProjectStatus::Idle);
    assert!(harness.engine.orchestrator.status().is_empty());

    // The interrupted task reverted to backlog with cleared timestamps
    let tasks = harness.engine.workspace.read_tasks(&harness.project_id).unwrap();
    assert_eq!(tasks.tasks.len(), 1);
    assert_eq!(tasks.tasks[0].status, TaskStatus::Backlog);
    assert!(tasks.tasks[0].started_at.is_none());
    assert!(tasks.tasks[0].verifying_at.is_none());
    assert!(tasks.tasks[0].completed_at.is_none());

    // The agent subprocess goes down within the SIGTERM/SIGKILL window
    let stopped = wait_until(Duration::from_secs(10), || {
        harness.engine.runner.active_pid(&harness.project_id).is_none()
    })
    .await;
    assert!(stopped, "agent process still alive after stop");
    assert!(stop_started.elapsed() < Duration::from_secs(10));

    // Workspace is retained on stop (only completion/delete remove it)
    assert!(harness.engine.workspace.has_workspace(&harness.project_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_cap_rejects_extra_start_until_release() {
    let temp = TempDir::new().unwrap();
    let agent = write_agent(&temp, "agent.sh", "sleep 30");
    let harness = build_harness(&temp, &agent, 3, 2);

    // Two more projects sharing the repository
    let repo_id = harness.engine.state.get_state().repositories[0].id.clone();
    let mut extra_ids = Vec::new();
    for name in ["Second", "Third"] {
        let project = harness
            .engine
            .state
            .create_project(ProjectInput {
                repository_id: repo_id.clone(),
                name: name.to_string(),
                description: String::new(),
                product_brief: None,
                solution_brief: None,
                base_branch: None,
                max_iterations: None,
            })
            .unwrap();
        extra_ids.push(project.id);
    }

    for id in [&harness.project_id, &extra_ids[0]] {
        commands::task_create(
            &harness.engine,
            id,
            commands::TaskInput {
                title: "spin".to_string(),
                description: String::new(),
                acceptance_criteria: vec![],
                priority: 0,
            },
        )
        .unwrap();
    }

    harness.engine.orchestrator.start(&harness.project_id).unwrap();
    harness.engine.orchestrator.start(&extra_ids[0]).unwrap();

    // Third start is rejected, state untouched
    let err = harness.engine.orchestrator.start(&extra_ids[1]).unwrap_err();
    assert!(err.to_string().contains("parallel"));
    assert_eq!(
        harness.engine.state.get_project(&extra_ids[1]).unwrap().status,
        ProjectStatus::Idle
    );

    // Starting an admitted project again is AlreadyRunning
    let err = harness.engine.orchestrator.start(&harness.project_id).unwrap_err();
    assert!(err.to_string().contains("already running"));

    // Releasing one slot admits the next
    harness.engine.orchestrator.stop(&harness.project_id).unwrap();
    harness.engine.orchestrator.start(&extra_ids[1]).unwrap();

    // Clean up the still-running loops
    let _ = harness.engine.orchestrator.stop(&extra_ids[0]);
    let _ = harness.engine.orchestrator.stop(&extra_ids[1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn external_task_added_between_iterations_is_picked_up() {
    let temp = TempDir::new().unwrap();
    let agent = write_agent(
        &temp,
        "agent.sh",
        r#"case "$2" in
  *Verdict*) echo VERIFICATION_PASSED;;
  *) echo hello > HELLO; echo TASK_COMPLETE;;
esac"#,
    );
    let harness = build_harness(&temp, &agent, 3, 1);
    let first_id = add_task(&harness, "First task", &["creates HELLO"], 1);

    harness.engine.orchestrator.start(&harness.project_id).unwrap();

    // Wait for the first task to finish, then splice a new task into
    // tasks.json the way an external writer (the agent) would
    let first_done = wait_until(Duration::from_secs(60), || {
        commands::logs_get(&harness.engine, &first_id)
            .iter()
            .any(|l| l.success)
    })
    .await;
    assert!(first_done, "first task never completed");

    let second_id = add_task(&harness, "Second task", &["creates HELLO too"], 2);

    let done = wait_until(Duration::from_secs(60), || {
        matches!(
            project_status(&harness),
            ProjectStatus::Completed | ProjectStatus::Failed
        )
    })
    .await;
    assert!(done, "project did not reach a terminal state");
    assert_eq!(project_status(&harness), ProjectStatus::Completed);

    // Both tasks ran and succeeded
    assert!(commands::logs_get(&harness.engine, &second_id)
        .iter()
        .any(|l| l.success));
}
