//! Installs the static agent-instructions file a task clone's coding
//! agent reads alongside its per-task prompt. Idempotent: never
//! overwrites an instructions file a repository already ships.

use std::path::Path;

use anyhow::{Context, Result};

const FILE_NAME: &str = "AGENTS.md";

const TEMPLATE: &str = r#"# Agent instructions

This repository is driven by an autonomous coding agent. Treat each
task branch as an isolated unit of work: make the smallest change that
satisfies the task description, run the project's own test suite
before reporting completion, and leave files outside the task's scope
untouched.

When asked to review rather than implement, report a verdict line of
the exact form `REVIEW_VERDICT: pass` or `REVIEW_VERDICT: fail`. On
`fail`, follow it with a `REVIEW_FAIL_FEEDBACK:` line describing
precisely what must change.
"#;

/// Write `AGENTS.md` into `repo_root` if it does not already exist.
pub fn install_agent_files(repo_root: &Path) -> Result<bool> {
    let path = repo_root.join(FILE_NAME);
    if path.exists() {
        return Ok(false);
    }
    std::fs::create_dir_all(repo_root).with_context(|| format!("failed to create {}", repo_root.display()))?;
    std::fs::write(&path, TEMPLATE).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}
