//! Implement/review prompt construction for the task lifecycle.

use crate::task::Task;

/// Feedback carried into a re-run of the implement prompt: either a
/// prior review's rejection, or a landing merge's remediation details.
/// Mutually exclusive in practice -- a task either retries because
/// review found a blocker or because landing hit a conflict, never
/// both in the same attempt.
#[derive(Debug, Clone)]
pub enum PriorFeedback {
    None,
    ReviewBlockers(String),
    LandingRemediation(String),
}

/// Build the implement-mode prompt for one attempt.
///
/// Sections, in order: mode header, task id/title/description, a
/// command contract, a strict TDD checklist, and -- only on a
/// remediation retry -- a loop-attempt banner plus the quoted prior
/// feedback. Never contains verdict instructions; those belong only in
/// [`build_review_prompt`].
pub fn build_implement_prompt(task: &Task, prior: &PriorFeedback, attempt: u32) -> String {
    let mut out = String::new();
    out.push_str("Mode: Implementation\n\n");
    out.push_str(&format!("Task: {}\n", task.id));
    out.push_str(&format!("Title: {}\n", task.title));
    out.push_str("\nDescription:\n");
    out.push_str(&task.description);
    out.push('\n');

    match prior {
        PriorFeedback::None => {}
        PriorFeedback::ReviewBlockers(feedback) => {
            out.push_str(&format!("\nReview Remediation Loop: Attempt {attempt}\n"));
            out.push_str("\nPrior Review Blockers:\n");
            out.push_str(feedback);
            out.push('\n');
        }
        PriorFeedback::LandingRemediation(details) => {
            out.push_str("\nLanding Merge Remediation:\n");
            out.push_str("\nMerge Failure Details:\n");
            out.push_str(details);
            out.push('\n');
        }
    }

    out.push_str("\nCommand Contract:\n");
    out.push_str("- Stay on this task; do not touch tracker tooling.\n");
    out.push_str("- Keep edits scoped to what this task describes.\n");
    out.push_str("- Do not modify unrelated files or tests.\n");

    out.push_str("\nStrict TDD Checklist:\n");
    out.push_str("- Write or update a failing test that captures the task's requirement.\n");
    out.push_str("- Implement the minimal change that makes the test pass.\n");
    out.push_str("- Run the full test suite before finishing.\n");
    out.push_str("- Leave the working tree clean except for intentional changes.\n");

    out
}

/// Build the review-mode prompt. Includes explicit verdict
/// instructions: the agent must emit a `REVIEW_VERDICT: pass|fail`
/// line and, on failure, a `REVIEW_FAIL_FEEDBACK: ...` line.
pub fn build_review_prompt(task: &Task) -> String {
    let mut out = String::new();
    out.push_str("Mode: Review\n\n");
    out.push_str(&format!("Task: {}\n", task.id));
    out.push_str(&format!("Title: {}\n", task.title));
    out.push_str("\nDescription:\n");
    out.push_str(&task.description);
    out.push('\n');

    out.push_str("\nReview Instructions:\n");
    out.push_str("- Check the implementation against the task description and its tests.\n");
    out.push_str("- Emit a line of the form `REVIEW_VERDICT: pass` or `REVIEW_VERDICT: fail`.\n");
    out.push_str(
        "- If the verdict is `fail`, also emit a `REVIEW_FAIL_FEEDBACK: ...` line describing exactly what is missing or wrong.\n",
    );

    out
}
