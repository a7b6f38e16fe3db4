//! The per-project run loop: setup, iterate over tasks, then publish.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::{select_next_task, RunStatus, SharedEntries};
use crate::agents::{
    build_log_key, default_allowed_tools, default_disallowed_tools,
    prompt::build_execution_prompt, task_log_path, AgentRunner, CancelToken, ProcessSpec,
};
use crate::config::EnginePaths;
use crate::events::{EventBus, OrchestratorLogPayload, EVENT_ORCHESTRATOR_LOG};
use crate::git::GitDriver;
use crate::models::{
    state_machine, LoopLogEntry, Project, ProjectStatus, Repository, Settings, Task,
    TaskLogEntry, TaskStatus,
};
use crate::state::StateManager;
use crate::utils::{lock_mutex_recover, now_iso};
use crate::verify::{Verifier, VerifySpec};
use crate::workspace::WorkspaceStore;

/// Sleep between iterations so fast-failing tasks do not spin.
const ITERATION_BACKOFF: Duration = Duration::from_secs(2);

pub(crate) struct LoopContext {
    pub project_id: String,
    pub state: Arc<StateManager>,
    pub workspace: Arc<WorkspaceStore>,
    pub git: Arc<GitDriver>,
    pub runner: Arc<AgentRunner>,
    pub verifier: Arc<Verifier>,
    pub events: Arc<EventBus>,
    pub paths: EnginePaths,
    pub entries: SharedEntries,
    pub cancel: CancelToken,
}

/// Entry point of the spawned project task.
pub(crate) async fn run_project(ctx: LoopContext) {
    if let Err(message) = drive(&ctx).await {
        if ctx.cancel.is_cancelled() {
            log::info!(
                "[Orchestrator] {}: loop ended after cancellation: {}",
                ctx.project_id,
                message
            );
        } else {
            log::error!("[Orchestrator] {}: {}", ctx.project_id, message);
            emit(&ctx, format!("Project failed: {}", message));
            if let Err(e) = ctx
                .state
                .set_project_status(&ctx.project_id, ProjectStatus::Failed)
            {
                log::warn!("[Orchestrator] Failed to mark project failed: {}", e);
            }
            set_entry_status(&ctx.entries, &ctx.project_id, RunStatus::Failed);
        }
    }

    // Drop the entry unless the loop parked itself in paused state
    let mut entries = lock_mutex_recover(&ctx.entries);
    if entries
        .get(&ctx.project_id)
        .map(|e| e.state.status != RunStatus::Paused)
        .unwrap_or(false)
    {
        entries.remove(&ctx.project_id);
    }
}

async fn drive(ctx: &LoopContext) -> Result<(), String> {
    let project = ctx
        .state
        .get_project(&ctx.project_id)
        .map_err(|e| e.to_string())?;
    let repo = ctx
        .state
        .repository_for_project(&ctx.project_id)
        .map_err(|e| e.to_string())?;

    // ---- Setup (first iteration only) ----
    emit(ctx, "Preparing workspace".to_string());

    let clone = ctx.git.clone_repo(&project.id, &repo.url).await;
    if !clone.ok {
        return Err(format!(
            "Clone failed: {}",
            clone.error.unwrap_or_default()
        ));
    }

    let base = ctx
        .git
        .checkout_or_create_branch(&project.id, &repo.url, &project.base_branch)
        .await;
    if !base.ok {
        return Err(format!(
            "Checkout of base branch '{}' failed: {}",
            project.base_branch,
            base.error.unwrap_or_default()
        ));
    }

    let working = ctx
        .git
        .create_working_branch(
            &project.id,
            &repo.url,
            &project.working_branch,
            &project.base_branch,
        )
        .await;
    if !working.ok {
        return Err(format!(
            "Creating working branch '{}' failed: {}",
            project.working_branch,
            working.error.unwrap_or_default()
        ));
    }

    ctx.workspace.initialize_ralph_folder(&project, &repo.url)?;
    set_entry_status(&ctx.entries, &ctx.project_id, RunStatus::Running);
    emit(
        ctx,
        format!("Workspace ready on branch {}", project.working_branch),
    );

    // ---- Iterate ----
    loop {
        if ctx.cancel.is_cancelled() {
            set_entry_status(&ctx.entries, &ctx.project_id, RunStatus::Stopped);
            return Ok(());
        }

        // Re-read so pause/stop flipped through the catalog are observed
        let project = ctx
            .state
            .get_project(&ctx.project_id)
            .map_err(|e| e.to_string())?;
        match project.status {
            ProjectStatus::Paused => {
                emit(ctx, "Loop paused".to_string());
                return Ok(());
            }
            ProjectStatus::Idle => {
                set_entry_status(&ctx.entries, &ctx.project_id, RunStatus::Stopped);
                return Ok(());
            }
            _ => {}
        }

        if project.current_iteration >= project.max_iterations {
            emit(
                ctx,
                format!(
                    "Reached maximum iterations ({}), giving up",
                    project.max_iterations
                ),
            );
            ctx.state
                .set_project_status(&ctx.project_id, ProjectStatus::Failed)
                .map_err(|e| e.to_string())?;
            set_entry_status(&ctx.entries, &ctx.project_id, RunStatus::Failed);
            return Ok(());
        }
        let iteration = project.current_iteration + 1;
        ctx.state
            .update_project(
                &ctx.project_id,
                crate::state::ProjectPatch {
                    current_iteration: Some(iteration),
                    ..Default::default()
                },
            )
            .map_err(|e| e.to_string())?;

        // Selection re-reads tasks.json so external edits are honored
        let tasks = ctx.workspace.read_tasks(&ctx.project_id)?;
        let Some(selected) = select_next_task(&tasks.tasks).cloned() else {
            break;
        };
        loop_log(
            ctx,
            iteration,
            Some(selected.id.clone()),
            "task_selected",
            None,
            None,
            format!("Selected task '{}'", selected.title),
        );

        let settings = ctx.state.settings();
        execute_task(ctx, &project, &repo, &settings, selected, &tasks.tasks, iteration).await?;

        if ctx.cancel.is_cancelled() {
            set_entry_status(&ctx.entries, &ctx.project_id, RunStatus::Stopped);
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(ITERATION_BACKOFF) => {}
            _ = ctx.cancel.cancelled() => {}
        }
    }

    // ---- Completion ----
    finish_project(ctx, &repo).await
}

async fn execute_task(
    ctx: &LoopContext,
    project: &Project,
    repo: &Repository,
    settings: &Settings,
    task: Task,
    all_tasks: &[Task],
    iteration: u32,
) -> Result<(), String> {
    let max_attempts = settings.max_task_attempts;
    let from = task.status;
    state_machine::transition_state(from, TaskStatus::InProgress).map_err(|e| e.to_string())?;

    let task = update_task(ctx, &task.id, |t| {
        t.status = TaskStatus::InProgress;
        t.attempts += 1;
        if t.started_at.is_none() {
            t.started_at = Some(Utc::now());
        }
        t.verifying_at = None;
        t.completed_at = None;
    })?;
    loop_log(
        ctx,
        iteration,
        Some(task.id.clone()),
        "status_change",
        Some(from.to_string()),
        Some(TaskStatus::InProgress.to_string()),
        format!("Attempt {} of {}", task.attempts, max_attempts),
    );
    set_entry_task(&ctx.entries, &ctx.project_id, Some(task.id.clone()));
    emit(
        ctx,
        format!(
            "Executing task '{}' (attempt {}/{})",
            task.title, task.attempts, max_attempts
        ),
    );

    let others: Vec<Task> = all_tasks
        .iter()
        .filter(|t| t.id != task.id)
        .cloned()
        .collect();
    let prompt = build_execution_prompt(project, &task, &others);
    let workdir = ctx.git.repo_dir(&project.id, &repo.url);
    let log_path = task_log_path(&ctx.paths.project_logs_dir(&project.id), &task.id);

    let spec = ProcessSpec {
        project_id: ctx.project_id.clone(),
        task_id: task.id.clone(),
        executable: settings.agent_executable.clone(),
        prompt,
        working_directory: workdir.clone(),
        log_file_path: log_path.clone(),
        allowed_tools: default_allowed_tools(),
        disallowed_tools: default_disallowed_tools(),
        cancel: ctx.cancel.clone(),
    };

    let outcome = match ctx.runner.run(spec).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // Could not even spawn; same attempt budget as any other failure,
            // else a bad agentExecutable keeps the task in play forever
            log::warn!("[Orchestrator] Agent spawn failed for {}: {}", task.id, e);
            record_task_log(
                ctx,
                &task.id,
                &log_path,
                false,
                format!("Agent failed to start: {}", e),
            );

            if task.attempts >= max_attempts {
                update_task(ctx, &task.id, |t| {
                    t.status = TaskStatus::Blocked;
                    t.completed_at = Some(Utc::now());
                })?;
                loop_log(
                    ctx,
                    iteration,
                    Some(task.id.clone()),
                    "status_change",
                    Some(TaskStatus::InProgress.to_string()),
                    Some(TaskStatus::Blocked.to_string()),
                    format!("Agent failed to start after {} attempts: {}", task.attempts, e),
                );
                emit(
                    ctx,
                    format!("Task '{}' blocked: agent failed to start: {}", task.title, e),
                );
            } else {
                emit(
                    ctx,
                    format!("Agent failed to start for '{}', will retry: {}", task.title, e),
                );
            }
            set_entry_task(&ctx.entries, &ctx.project_id, None);
            return Ok(());
        }
    };

    // Stop observed: leave everything for stop() to clean up
    if outcome.stopped || ctx.cancel.is_cancelled() {
        return Ok(());
    }

    if outcome.task_blocked {
        let reason = outcome
            .blocked_reason
            .unwrap_or_else(|| "agent reported a blocker".to_string());
        record_task_log(
            ctx,
            &task.id,
            &outcome.log_file_path,
            false,
            format!("Blocked: {}", reason),
        );

        if task.attempts >= max_attempts {
            update_task(ctx, &task.id, |t| {
                t.status = TaskStatus::Blocked;
                t.completed_at = Some(Utc::now());
            })?;
            loop_log(
                ctx,
                iteration,
                Some(task.id.clone()),
                "status_change",
                Some(TaskStatus::InProgress.to_string()),
                Some(TaskStatus::Blocked.to_string()),
                format!("Blocked after {} attempts: {}", task.attempts, reason),
            );
            emit(
                ctx,
                format!("Task '{}' blocked: {}", task.title, reason),
            );
        } else {
            emit(
                ctx,
                format!("Task '{}' hit a blocker, will retry: {}", task.title, reason),
            );
        }
        set_entry_task(&ctx.entries, &ctx.project_id, None);
        return Ok(());
    }

    if outcome.task_complete {
        update_task(ctx, &task.id, |t| {
            t.status = TaskStatus::Verifying;
            t.verifying_at = Some(Utc::now());
        })?;
        loop_log(
            ctx,
            iteration,
            Some(task.id.clone()),
            "status_change",
            Some(TaskStatus::InProgress.to_string()),
            Some(TaskStatus::Verifying.to_string()),
            "Agent reported completion, verifying".to_string(),
        );
        emit(ctx, format!("Verifying task '{}'", task.title));

        let diff = ctx.git.get_diff(&project.id, &repo.url).await;
        let verify_log = task_log_path(
            &ctx.paths.project_logs_dir(&project.id),
            &build_log_key(&task.id, "verify"),
        );
        let result = ctx
            .verifier
            .verify_task(VerifySpec {
                project_id: ctx.project_id.clone(),
                task: task.clone(),
                executable: settings.agent_executable.clone(),
                working_directory: workdir,
                log_file_path: verify_log,
                diff: diff.output,
                cancel: ctx.cancel.clone(),
            })
            .await;

        if ctx.cancel.is_cancelled() {
            return Ok(());
        }

        if result.passed {
            // Land the work before declaring the task done; a clean tree
            // commits as a successful no-op
            let commit = ctx
                .git
                .commit(
                    &project.id,
                    &repo.url,
                    &format!("Complete task: {}", task.title),
                )
                .await;

            if commit.ok {
                update_task(ctx, &task.id, |t| {
                    t.status = TaskStatus::Done;
                    t.completed_at = Some(Utc::now());
                })?;
                loop_log(
                    ctx,
                    iteration,
                    Some(task.id.clone()),
                    "status_change",
                    Some(TaskStatus::Verifying.to_string()),
                    Some(TaskStatus::Done.to_string()),
                    "Verification passed".to_string(),
                );
                record_task_log(
                    ctx,
                    &task.id,
                    &outcome.log_file_path,
                    true,
                    "Verification passed".to_string(),
                );
                emit(ctx, format!("Task '{}' done", task.title));
            } else {
                let error = commit.error.unwrap_or_default();
                log::warn!(
                    "[Orchestrator] Commit failed for task {}: {}",
                    task.id,
                    error
                );
                record_task_log(
                    ctx,
                    &task.id,
                    &outcome.log_file_path,
                    false,
                    format!("Commit failed: {}", error),
                );

                if task.attempts >= max_attempts {
                    update_task(ctx, &task.id, |t| {
                        t.status = TaskStatus::Blocked;
                        t.completed_at = Some(Utc::now());
                    })?;
                    loop_log(
                        ctx,
                        iteration,
                        Some(task.id.clone()),
                        "status_change",
                        Some(TaskStatus::Verifying.to_string()),
                        Some(TaskStatus::Blocked.to_string()),
                        format!("Commit failed after {} attempts: {}", task.attempts, error),
                    );
                    emit(
                        ctx,
                        format!("Task '{}' blocked: commit failed: {}", task.title, error),
                    );
                } else {
                    update_task(ctx, &task.id, |t| {
                        t.status = TaskStatus::InProgress;
                        t.verifying_at = None;
                    })?;
                    loop_log(
                        ctx,
                        iteration,
                        Some(task.id.clone()),
                        "status_change",
                        Some(TaskStatus::Verifying.to_string()),
                        Some(TaskStatus::InProgress.to_string()),
                        format!("Commit failed, retrying: {}", error),
                    );
                    emit(
                        ctx,
                        format!("Commit failed for '{}', retrying: {}", task.title, error),
                    );
                }
            }
        } else {
            let reason = result
                .review
                .reason
                .clone()
                .unwrap_or_else(|| "verification failed".to_string());
            record_task_log(
                ctx,
                &task.id,
                &outcome.log_file_path,
                false,
                format!("Verification failed: {}", reason),
            );

            if task.attempts >= max_attempts {
                update_task(ctx, &task.id, |t| {
                    t.status = TaskStatus::Blocked;
                    t.completed_at = Some(Utc::now());
                })?;
                loop_log(
                    ctx,
                    iteration,
                    Some(task.id.clone()),
                    "status_change",
                    Some(TaskStatus::Verifying.to_string()),
                    Some(TaskStatus::Blocked.to_string()),
                    format!("Verification failed after {} attempts: {}", task.attempts, reason),
                );
                emit(
                    ctx,
                    format!("Task '{}' blocked: {}", task.title, reason),
                );
            } else {
                // Back to in_progress for another execution pass;
                // started_at is preserved
                update_task(ctx, &task.id, |t| {
                    t.status = TaskStatus::InProgress;
                    t.verifying_at = None;
                })?;
                loop_log(
                    ctx,
                    iteration,
                    Some(task.id.clone()),
                    "status_change",
                    Some(TaskStatus::Verifying.to_string()),
                    Some(TaskStatus::InProgress.to_string()),
                    format!("Verification failed, retrying: {}", reason),
                );
                emit(
                    ctx,
                    format!("Verification failed for '{}', retrying: {}", task.title, reason),
                );
            }
        }
        set_entry_task(&ctx.entries, &ctx.project_id, None);
        return Ok(());
    }

    // Neither signal: leave in_progress, the loop retries
    record_task_log(
        ctx,
        &task.id,
        &outcome.log_file_path,
        false,
        "Agent finished without reporting completion".to_string(),
    );
    emit(
        ctx,
        format!(
            "Task '{}' ended without a completion signal, will retry",
            task.title
        ),
    );
    set_entry_task(&ctx.entries, &ctx.project_id, None);
    Ok(())
}

async fn finish_project(ctx: &LoopContext, repo: &Repository) -> Result<(), String> {
    let project = ctx
        .state
        .get_project(&ctx.project_id)
        .map_err(|e| e.to_string())?;
    let tasks = ctx.workspace.read_tasks(&ctx.project_id)?.tasks;

    let completed: Vec<&Task> = tasks.iter().filter(|t| t.status == TaskStatus::Done).collect();
    let blocked: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .collect();
    emit(
        ctx,
        format!(
            "Task list drained: {} done, {} blocked",
            completed.len(),
            blocked.len()
        ),
    );

    if completed.is_empty() {
        let status = if blocked.is_empty() {
            ProjectStatus::Completed
        } else {
            ProjectStatus::Failed
        };
        return conclude(ctx, status).await;
    }

    // Nothing actually changed relative to base: done without a PR
    let diff = ctx
        .git
        .get_diff_from_base(&project.id, &repo.url, &project.base_branch)
        .await;
    if diff.ok && diff.output.trim().is_empty() {
        emit(ctx, "No changes relative to base branch".to_string());
        return conclude(ctx, ProjectStatus::Completed).await;
    }

    let base = ctx
        .git
        .ensure_base_branch_pushed(&project.id, &repo.url, &project.base_branch)
        .await;
    if !base.ok {
        emit(
            ctx,
            format!(
                "Failed to publish base branch: {}",
                base.error.unwrap_or_default()
            ),
        );
        return conclude(ctx, ProjectStatus::Failed).await;
    }

    let push = ctx
        .git
        .push(&project.id, &repo.url, &project.working_branch)
        .await;
    if !push.ok {
        emit(
            ctx,
            format!(
                "Failed to push working branch: {}",
                push.error.unwrap_or_default()
            ),
        );
        return conclude(ctx, ProjectStatus::Failed).await;
    }
    emit(ctx, format!("Pushed branch {}", project.working_branch));

    let body = build_pr_body(&project, &completed, &blocked);
    let pr = ctx
        .git
        .create_pull_request(
            &project.id,
            &repo.url,
            &project.name,
            &body,
            &project.base_branch,
        )
        .await;
    if pr.ok {
        emit(ctx, format!("Pull request created: {}", pr.output));
        conclude(ctx, ProjectStatus::Completed).await
    } else {
        // The work is on the remote even though the PR is not
        emit(
            ctx,
            format!(
                "Pull request creation failed (branch remains pushed): {}",
                pr.error.unwrap_or_default()
            ),
        );
        conclude(ctx, ProjectStatus::Failed).await
    }
}

/// Terminal bookkeeping shared by all completion paths: project status,
/// workspace cleanup, entry state.
async fn conclude(ctx: &LoopContext, status: ProjectStatus) -> Result<(), String> {
    ctx.state
        .set_project_status(&ctx.project_id, status)
        .map_err(|e| e.to_string())?;

    let cleanup = ctx.git.cleanup_workspace(&ctx.project_id).await;
    if !cleanup.ok {
        log::warn!(
            "[Orchestrator] Workspace cleanup failed for {}: {:?}",
            ctx.project_id,
            cleanup.error
        );
    }

    let entry_status = match status {
        ProjectStatus::Completed => RunStatus::Completed,
        _ => RunStatus::Failed,
    };
    set_entry_status(&ctx.entries, &ctx.project_id, entry_status);
    emit(ctx, format!("Project finished: {}", status));
    Ok(())
}

fn build_pr_body(project: &Project, completed: &[&Task], blocked: &[&Task]) -> String {
    let mut body = String::new();
    if !project.description.is_empty() {
        body.push_str(&project.description);
        body.push_str("\n\n");
    }

    body.push_str("### Completed tasks\n\n");
    for task in completed {
        body.push_str(&format!("- [x] {}\n", task.title));
    }

    if !blocked.is_empty() {
        body.push_str("\n### Blocked tasks\n\n");
        for task in blocked {
            body.push_str(&format!("- [ ] {}\n", task.title));
        }
    }

    body
}

fn update_task(
    ctx: &LoopContext,
    task_id: &str,
    mutate: impl FnOnce(&mut Task),
) -> Result<Task, String> {
    let mut updated = None;
    ctx.workspace.mutate_tasks(&ctx.project_id, |file| {
        if let Some(task) = file.tasks.iter_mut().find(|t| t.id == task_id) {
            mutate(task);
            updated = Some(task.clone());
        }
    })?;
    updated.ok_or_else(|| format!("Task {} disappeared from tasks.json", task_id))
}

fn record_task_log(
    ctx: &LoopContext,
    task_id: &str,
    log_path: &std::path::Path,
    success: bool,
    summary: String,
) {
    let entry = TaskLogEntry {
        timestamp: Utc::now(),
        file_path: log_path.to_string_lossy().to_string(),
        summary,
        success,
    };
    if let Err(e) = ctx.state.append_task_log(task_id, entry) {
        log::warn!("[Orchestrator] Failed to record task log: {}", e);
    }
}

#[allow(clippy::too_many_arguments)]
fn loop_log(
    ctx: &LoopContext,
    iteration: u32,
    task_id: Option<String>,
    action: &str,
    from: Option<String>,
    to: Option<String>,
    message: String,
) {
    let entry = LoopLogEntry {
        timestamp: Utc::now(),
        iteration,
        task_id,
        action: action.to_string(),
        from,
        to,
        message,
    };
    if let Err(e) = ctx.workspace.append_log(&ctx.project_id, entry) {
        log::warn!("[Orchestrator] Failed to append loop log: {}", e);
    }
}

fn emit(ctx: &LoopContext, message: String) {
    log::info!("[Orchestrator] {}: {}", ctx.project_id, message);
    ctx.events.emit(
        EVENT_ORCHESTRATOR_LOG,
        OrchestratorLogPayload {
            project_id: ctx.project_id.clone(),
            message,
            timestamp: now_iso(),
        },
    );
}

fn set_entry_status(entries: &SharedEntries, project_id: &str, status: RunStatus) {
    let mut entries = lock_mutex_recover(entries);
    if let Some(entry) = entries.get_mut(project_id) {
        entry.state.status = status;
    }
}

fn set_entry_task(entries: &SharedEntries, project_id: &str, task_id: Option<String>) {
    let mut entries = lock_mutex_recover(entries);
    if let Some(entry) = entries.get_mut(project_id) {
        entry.state.current_task_id = task_id;
    }
}
