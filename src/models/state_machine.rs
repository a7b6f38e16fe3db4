// Task status state machine with validation

use super::TaskStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Invalid task transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

/// Validates if a task can transition from one status to another.
///
/// The run loop is a fold over these transitions; anything outside this table
/// is a bug in the caller, not a recoverable condition.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    match (from, to) {
        // From Backlog
        (TaskStatus::Backlog, TaskStatus::InProgress) => true,

        // From InProgress
        (TaskStatus::InProgress, TaskStatus::Verifying) => true,
        (TaskStatus::InProgress, TaskStatus::Blocked) => true,
        // Reverted on stop
        (TaskStatus::InProgress, TaskStatus::Backlog) => true,

        // From Verifying
        (TaskStatus::Verifying, TaskStatus::Done) => true,
        // Review failed, retry execution
        (TaskStatus::Verifying, TaskStatus::InProgress) => true,
        (TaskStatus::Verifying, TaskStatus::Blocked) => true,
        (TaskStatus::Verifying, TaskStatus::Backlog) => true,

        // Done and Blocked are terminal

        // Same state is always allowed (no-op)
        (a, b) if a == b => true,

        _ => false,
    }
}

/// Validates and performs a state transition.
pub fn transition_state(
    current: TaskStatus,
    target: TaskStatus,
) -> Result<TaskStatus, TransitionError> {
    if !can_transition(current, target) {
        return Err(TransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }
    Ok(target)
}

/// Check if a status is a terminal state.
pub fn is_terminal_state(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Done | TaskStatus::Blocked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backlog_to_in_progress() {
        assert!(can_transition(TaskStatus::Backlog, TaskStatus::InProgress));
        assert!(transition_state(TaskStatus::Backlog, TaskStatus::InProgress).is_ok());
    }

    #[test]
    fn test_backlog_cannot_skip_execution() {
        assert!(!can_transition(TaskStatus::Backlog, TaskStatus::Verifying));
        assert!(!can_transition(TaskStatus::Backlog, TaskStatus::Done));
        assert!(transition_state(TaskStatus::Backlog, TaskStatus::Done).is_err());
    }

    #[test]
    fn test_in_progress_transitions() {
        assert!(can_transition(
            TaskStatus::InProgress,
            TaskStatus::Verifying
        ));
        assert!(can_transition(TaskStatus::InProgress, TaskStatus::Blocked));
        assert!(can_transition(TaskStatus::InProgress, TaskStatus::Backlog));
        assert!(!can_transition(TaskStatus::InProgress, TaskStatus::Done));
    }

    #[test]
    fn test_verifying_transitions() {
        assert!(can_transition(TaskStatus::Verifying, TaskStatus::Done));
        assert!(can_transition(
            TaskStatus::Verifying,
            TaskStatus::InProgress
        ));
        assert!(can_transition(TaskStatus::Verifying, TaskStatus::Blocked));
    }

    #[test]
    fn test_terminal_states() {
        assert!(is_terminal_state(TaskStatus::Done));
        assert!(is_terminal_state(TaskStatus::Blocked));
        assert!(!is_terminal_state(TaskStatus::InProgress));
        assert!(!can_transition(TaskStatus::Done, TaskStatus::InProgress));
        assert!(!can_transition(TaskStatus::Blocked, TaskStatus::Backlog));
    }

    #[test]
    fn test_same_state_allowed() {
        assert!(can_transition(TaskStatus::Backlog, TaskStatus::Backlog));
        assert!(can_transition(
            TaskStatus::InProgress,
            TaskStatus::InProgress
        ));
        assert!(can_transition(TaskStatus::Done, TaskStatus::Done));
    }
}
