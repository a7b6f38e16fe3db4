//! Task selection policy.

use crate::models::{Task, TaskStatus};

/// Pick the next task to drive:
///
/// 1. an `in_progress` task (resume interrupted work),
/// 2. a `verifying` task (retry after a previously failed review),
/// 3. the lowest-priority `backlog` task.
///
/// Ties on priority keep insertion order (first wins).
pub fn select_next_task(tasks: &[Task]) -> Option<&Task> {
    if let Some(task) = tasks.iter().find(|t| t.status == TaskStatus::InProgress) {
        return Some(task);
    }
    if let Some(task) = tasks.iter().find(|t| t.status == TaskStatus::Verifying) {
        return Some(task);
    }

    let mut best: Option<&Task> = None;
    for task in tasks.iter().filter(|t| t.status == TaskStatus::Backlog) {
        match best {
            Some(current) if task.priority >= current.priority => {}
            _ => best = Some(task),
        }
    }
    best
}
