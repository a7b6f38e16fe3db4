//! Agent subprocess supervision.
//!
//! The agent CLI runs under a pseudo-terminal (120x30) with color disabled.
//! Combined output streams into the per-run log file and onto the event bus
//! chunk by chunk, while an in-memory transcript accumulates for signal
//! parsing. Cancellation delivers SIGTERM, then SIGKILL after a short grace
//! period.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use tokio::sync::mpsc;

use super::log_file::TaskLogFile;
use super::signals::parse_agent_signals;
use super::CancelToken;
use crate::events::{EventBus, LogUpdatePayload, EVENT_LOG_UPDATE};
use crate::utils::lock_mutex_recover;

/// Grace period between SIGTERM and SIGKILL on cancellation.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for an exit status after the PTY closes before forcing
/// the process down.
const EXIT_WAIT: Duration = Duration::from_secs(5);

/// Everything needed to run one agent pass.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub project_id: String,
    /// Task id for event payloads; verification passes use `<taskId>-verify`
    pub task_id: String,
    /// Agent CLI to invoke (the `agentExecutable` setting)
    pub executable: String,
    pub prompt: String,
    /// Repository checkout the agent works in
    pub working_directory: PathBuf,
    pub log_file_path: PathBuf,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub cancel: CancelToken,
}

/// Result of one agent pass.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Process exited cleanly and was not cancelled
    pub ok: bool,
    /// Run was cancelled
    pub stopped: bool,
    pub exit_code: Option<u32>,
    pub combined_output: String,
    pub task_complete: bool,
    pub task_blocked: bool,
    pub blocked_reason: Option<String>,
    pub log_file_path: PathBuf,
}

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

pub struct AgentRunner {
    events: Arc<EventBus>,
    /// OS pid of the in-flight agent per project, for status reporting
    active_pids: Mutex<HashMap<String, u32>>,
}

impl AgentRunner {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            events,
            active_pids: Mutex::new(HashMap::new()),
        }
    }

    /// Pid of the agent currently running for a project, if any.
    pub fn active_pid(&self, project_id: &str) -> Option<u32> {
        lock_mutex_recover(&self.active_pids).get(project_id).copied()
    }

    /// Run the agent CLI to completion (or cancellation).
    pub async fn run(&self, spec: ProcessSpec) -> Result<AgentOutcome> {
        let mut log_file = TaskLogFile::create(
            spec.log_file_path.clone(),
            &spec.project_id,
            &spec.task_id,
            &spec.working_directory,
            &spec.prompt,
        )
        .map_err(|e| anyhow!(e))?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 30,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&spec.executable);
        cmd.arg("-p");
        cmd.arg(&spec.prompt);
        cmd.args(["--output-format", "stream-json", "--verbose"]);
        cmd.args(["--permission-mode", "acceptEdits"]);
        for tool in &spec.allowed_tools {
            cmd.arg("--allowedTools");
            cmd.arg(tool);
        }
        for tool in &spec.disallowed_tools {
            cmd.arg("--disallowedTools");
            cmd.arg(tool);
        }
        cmd.env("NO_COLOR", "1");
        cmd.env("FORCE_COLOR", "0");
        cmd.cwd(&spec.working_directory);

        log::info!(
            "[AgentRunner] Spawning {} for task {} in {:?}",
            spec.executable,
            spec.task_id,
            spec.working_directory
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn agent process")?;
        drop(pair.slave);

        if let Some(pid) = child.process_id() {
            lock_mutex_recover(&self.active_pids).insert(spec.project_id.clone(), pid);
        }
        let child: SharedChild = Arc::new(Mutex::new(child));

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        // Keep the master alive for the duration of the run; dropping it
        // closes the PTY under the child.
        let _master = pair.master;

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut combined = String::new();
        let mut stopped = false;
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(chunk) => {
                        log_file.append_chunk(&chunk);
                        let text = String::from_utf8_lossy(&chunk).to_string();
                        combined.push_str(&text);
                        self.events.emit(
                            EVENT_LOG_UPDATE,
                            LogUpdatePayload {
                                project_id: spec.project_id.clone(),
                                task_id: spec.task_id.clone(),
                                chunk: text,
                            },
                        );
                    }
                    // PTY closed: the process is gone or going
                    None => break,
                },
                _ = spec.cancel.cancelled(), if !stopped => {
                    stopped = true;
                    log::info!(
                        "[AgentRunner] Cancellation requested for task {}, sending SIGTERM",
                        spec.task_id
                    );
                    send_signal(&child, libc::SIGTERM);

                    let escalate = Arc::clone(&child);
                    let task_id = spec.task_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(KILL_GRACE).await;
                        let exited = {
                            let mut guard = lock_mutex_recover(&escalate);
                            guard.try_wait().ok().flatten().is_some()
                        };
                        if !exited {
                            log::warn!(
                                "[AgentRunner] Task {} did not exit after SIGTERM, killing",
                                task_id
                            );
                            send_signal(&escalate, libc::SIGKILL);
                        }
                    });
                }
            }
        }

        let exit_code = wait_for_exit(&child).await;
        lock_mutex_recover(&self.active_pids).remove(&spec.project_id);

        let exit_description = if stopped {
            "terminated".to_string()
        } else {
            match exit_code {
                Some(code) => format!("code {}", code),
                None => "unknown".to_string(),
            }
        };
        log_file.finish(&exit_description);

        let signals = if stopped {
            Default::default()
        } else {
            parse_agent_signals(&combined)
        };

        log::info!(
            "[AgentRunner] Task {} finished: exit={}, complete={}, blocked={}",
            spec.task_id,
            exit_description,
            signals.task_complete,
            signals.task_blocked
        );

        Ok(AgentOutcome {
            ok: !stopped && exit_code == Some(0),
            stopped,
            exit_code,
            combined_output: combined,
            task_complete: signals.task_complete,
            task_blocked: signals.task_blocked,
            blocked_reason: signals.blocked_reason,
            log_file_path: spec.log_file_path,
        })
    }
}

/// Signal the agent's whole process group (it is a session leader on its
/// PTY), falling back to the immediate pid.
fn send_signal(child: &SharedChild, signal: libc::c_int) {
    let guard = lock_mutex_recover(child);
    if let Some(pid) = guard.process_id() {
        let pid = pid as libc::pid_t;
        unsafe {
            if libc::kill(-pid, signal) != 0 {
                libc::kill(pid, signal);
            }
        }
    }
}

/// Poll for the exit status after the PTY closed. A process ignoring the PTY
/// teardown gets killed after [`EXIT_WAIT`].
async fn wait_for_exit(child: &SharedChild) -> Option<u32> {
    let poll = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    let mut killed = false;

    loop {
        {
            let mut guard = lock_mutex_recover(child);
            match guard.try_wait() {
                Ok(Some(status)) => return Some(status.exit_code()),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("[AgentRunner] try_wait failed: {}", e);
                    return None;
                }
            }
        }
        if waited >= EXIT_WAIT && !killed {
            killed = true;
            send_signal(child, libc::SIGKILL);
        } else if killed && waited >= EXIT_WAIT * 2 {
            return None;
        }
        tokio::time::sleep(poll).await;
        waited += poll;
    }
}
