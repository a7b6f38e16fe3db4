//! Prompt assembly for execution and verification passes.

use crate::models::{Project, Task};

/// Build the prompt driving one execution pass for a task.
///
/// `other_tasks` is the rest of the project's task list, included as context
/// only so the agent does not wander into neighboring work.
pub fn build_execution_prompt(project: &Project, task: &Task, other_tasks: &[Task]) -> String {
    let mut prompt = String::new();

    if let Some(brief) = project.product_brief.as_deref().filter(|b| !b.is_empty()) {
        prompt.push_str("# Project Context\n\n");
        prompt.push_str(brief);
        prompt.push_str("\n\n");
    }

    if let Some(brief) = project.solution_brief.as_deref().filter(|b| !b.is_empty()) {
        prompt.push_str("# Solution Overview\n\n");
        prompt.push_str(brief);
        prompt.push_str("\n\n");
    }

    prompt.push_str("# Current Task\n\n");
    prompt.push_str(&format!("**{}**\n\n", task.title));
    if !task.description.is_empty() {
        prompt.push_str(&task.description);
        prompt.push_str("\n\n");
    }

    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("## Acceptance Criteria\n\n");
        for (i, criterion) in task.acceptance_criteria.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "# Instructions\n\n\
         1. Read the relevant code to understand the current behavior.\n\
         2. Implement the task so every acceptance criterion is satisfied.\n\
         3. Run the project's tests and make sure they pass.\n\
         4. Commit your work with a descriptive message (git add / git commit).\n\n\
         When the task is fully done, print exactly:\n\n\
         TASK_COMPLETE\n\n\
         If you cannot complete the task, print exactly:\n\n\
         TASK_BLOCKED: <short reason>\n\n",
    );

    if !other_tasks.is_empty() {
        prompt.push_str("# Other Tasks\n\nFor context only - do NOT work on these:\n\n");
        for other in other_tasks {
            prompt.push_str(&format!("- [{}] {}\n", other.status, other.title));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "# Important Notes\n\n\
         - Stay focused on the current task; do not modify unrelated code.\n\
         - Never push to the remote or open pull requests; the engine does that.\n\
         - Keep the test suite green.\n",
    );

    prompt
}

/// Build the prompt for the self-review pass over a finished task.
pub fn build_verification_prompt(task: &Task, diff: &str, test_output: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str("# Verification\n\n");
    prompt.push_str(&format!(
        "Review the changes made for this task:\n\n**{}**\n\n",
        task.title
    ));
    if !task.description.is_empty() {
        prompt.push_str(&task.description);
        prompt.push_str("\n\n");
    }

    prompt.push_str("## Acceptance Criteria\n\n");
    for (i, criterion) in task.acceptance_criteria.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, criterion));
    }

    prompt.push_str("\n## Changes\n\n```diff\n");
    prompt.push_str(diff);
    if !diff.ends_with('\n') {
        prompt.push('\n');
    }
    prompt.push_str("```\n\n## Test Output\n\n```\n");
    prompt.push_str(test_output);
    if !test_output.ends_with('\n') {
        prompt.push('\n');
    }
    prompt.push_str("```\n\n");

    prompt.push_str(
        "# Verdict\n\n\
         Check each acceptance criterion against the diff and test output.\n\
         If every criterion is satisfied, print exactly:\n\n\
         VERIFICATION_PASSED\n\n\
         Otherwise print exactly:\n\n\
         VERIFICATION_FAILED: <short reason>\n",
    );

    prompt
}
