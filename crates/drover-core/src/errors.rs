//! Error classifier: a pure function mapping a raw error string to a
//! stable category tag plus a remediation hint.

use std::fmt;

/// Stable category tags. These strings are part of the external
/// contract (appear in logs/metadata) and must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    MergeQueueConflict,
    ReviewGating,
    RunnerTimeoutStall,
    RunnerInit,
    AuthProfileConfig,
    FilesystemClone,
    LockContention,
    Tracker,
    GitVcs,
    Unknown,
}

impl Category {
    pub fn tag(self) -> &'static str {
        match self {
            Category::MergeQueueConflict => "merge_queue_conflict",
            Category::ReviewGating => "review_gating",
            Category::RunnerTimeoutStall => "runner_timeout_stall",
            Category::RunnerInit => "runner_init",
            Category::AuthProfileConfig => "auth_profile_config",
            Category::FilesystemClone => "filesystem_clone",
            Category::LockContention => "lock_contention",
            Category::Tracker => "tracker",
            Category::GitVcs => "git/vcs",
            Category::Unknown => "unknown",
        }
    }

    fn remediation(self) -> &'static str {
        match self {
            Category::MergeQueueConflict => {
                "resolve the conflicting edit in the task branch and retry landing"
            }
            Category::ReviewGating => {
                "address the reviewer's feedback and let the remediation loop re-run implement"
            }
            Category::RunnerTimeoutStall => {
                "increase the runner timeout or investigate why the agent stopped producing output"
            }
            Category::RunnerInit => {
                "check the agent backend's binary path, credentials, and startup arguments"
            }
            Category::AuthProfileConfig => {
                "verify the configured credentials/profile for the backend or tracker"
            }
            Category::FilesystemClone => {
                "check disk space and repository permissions at the clone path"
            }
            Category::LockContention => {
                "another worker currently holds this lock; no action needed, it will be retried"
            }
            Category::Tracker => "check tracker connectivity and task id validity",
            Category::GitVcs => "inspect the git command output for the underlying cause",
            Category::Unknown => "inspect the full error text; no known remediation applies",
        }
    }
}

/// A classified error, ready for display via [`fmt::Display`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub category: Category,
    pub cause: String,
}

impl fmt::Display for Classified {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Category: {}\nCause: {}\nNext step: {}",
            self.category.tag(),
            self.cause,
            self.category.remediation()
        )
    }
}

/// Ordered (most-specific-first) substring rules. Matching is
/// case-insensitive; the first rule whose substring appears anywhere in
/// the cleaned message wins.
const RULES: &[(&str, Category)] = &[
    ("conflict", Category::MergeQueueConflict),
    ("automatic merge failed", Category::MergeQueueConflict),
    ("review_verdict", Category::ReviewGating),
    ("review rejected", Category::ReviewGating),
    ("review", Category::ReviewGating),
    ("timeout", Category::RunnerTimeoutStall),
    ("no output", Category::RunnerTimeoutStall),
    ("stall", Category::RunnerTimeoutStall),
    ("deadline exceeded", Category::RunnerTimeoutStall),
    ("failed to start", Category::RunnerInit),
    ("failed to spawn", Category::RunnerInit),
    ("binary not found", Category::RunnerInit),
    ("no such file or directory", Category::RunnerInit),
    ("unauthorized", Category::AuthProfileConfig),
    ("authentication", Category::AuthProfileConfig),
    ("permission denied", Category::AuthProfileConfig),
    ("credentials", Category::AuthProfileConfig),
    ("no space left", Category::FilesystemClone),
    ("disk quota", Category::FilesystemClone),
    ("clone", Category::FilesystemClone),
    ("worktree", Category::FilesystemClone),
    ("lock held", Category::LockContention),
    ("already locked", Category::LockContention),
    ("lock denied", Category::LockContention),
    ("tracker", Category::Tracker),
    ("issue not found", Category::Tracker),
    ("git", Category::GitVcs),
    ("vcs", Category::GitVcs),
];

/// Classify a raw error message.
///
/// Pre-processing: join wrapped/chained lines into one (newline ->
/// `; `), strip a trailing generic `exit status <N>` suffix or
/// standalone line, then match the cleaned message against [`RULES`].
/// The first informative clause (the text before the first `;`, after
/// cleanup) becomes the cause.
pub fn classify(raw: &str) -> Classified {
    let joined = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("; ");

    let cleaned = strip_exit_status_suffix(&joined);
    let lowercased = cleaned.to_lowercase();

    let category = RULES
        .iter()
        .find(|(needle, _)| lowercased.contains(needle))
        .map(|(_, cat)| *cat)
        .unwrap_or(Category::Unknown);

    let cause = first_clause(&cleaned);

    Classified { category, cause }
}

/// Strip a trailing `exit status <N>` clause (and any standalone
/// `exit status <N>` line already folded into the joined message by
/// [`classify`]).
fn strip_exit_status_suffix(s: &str) -> String {
    let trimmed = s.trim_end();
    let lower = trimmed.to_lowercase();
    if let Some(pos) = lower.rfind("exit status") {
        // Only strip if it's trailing (nothing meaningful after the
        // status number) -- find the end of the digits following it.
        let after = &trimmed[pos..];
        let tail_is_just_number = after["exit status".len()..]
            .trim()
            .chars()
            .all(|c| c.is_ascii_digit());
        if tail_is_just_number {
            let mut head = trimmed[..pos].trim_end();
            head = head.trim_end_matches(';').trim_end_matches(',').trim_end();
            if !head.is_empty() {
                return head.to_string();
            }
        }
    }
    trimmed.to_string()
}

/// The first `; `-delimited clause, truncated byte-boundary safe with
/// a trailing ellipsis.
fn first_clause(s: &str) -> String {
    let clause = s.split(';').next().unwrap_or(s).trim();
    truncate_snippet(clause, 512)
}

/// UTF-8-boundary-safe truncation.
fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_merge_conflict() {
        let c = classify("git merge failed: CONFLICT (content): Merge conflict in src/lib.rs");
        assert_eq!(c.category, Category::MergeQueueConflict);
    }

    #[test]
    fn classifies_runner_timeout() {
        let c = classify("runner timeout after 300s");
        assert_eq!(c.category, Category::RunnerTimeoutStall);
    }

    #[test]
    fn classifies_review_rejection() {
        let c = classify("review rejected: missing regression test");
        assert_eq!(c.category, Category::ReviewGating);
    }

    #[test]
    fn classifies_lock_contention() {
        let c = classify("lock denied: task already locked by worker-2");
        assert_eq!(c.category, Category::LockContention);
    }

    #[test]
    fn unmatched_text_is_unknown() {
        let c = classify("the sky fell down");
        assert_eq!(c.category, Category::Unknown);
    }

    #[test]
    fn is_case_insensitive() {
        let c = classify("RUNNER TIMEOUT AFTER 10s");
        assert_eq!(c.category, Category::RunnerTimeoutStall);
    }

    #[test]
    fn strips_trailing_exit_status_suffix() {
        let c = classify("command failed\nexit status 1");
        assert_eq!(c.cause, "command failed");
    }

    #[test]
    fn does_not_strip_exit_status_when_not_trailing() {
        let cleaned = strip_exit_status_suffix("exit status 1 happened first; then timeout");
        assert!(cleaned.contains("exit status 1"));
    }

    #[test]
    fn display_format_has_three_labeled_lines() {
        let c = classify("clone failed: permission denied");
        let rendered = c.to_string();
        assert!(rendered.starts_with("Category: "));
        assert!(rendered.contains("\nCause: "));
        assert!(rendered.contains("\nNext step: "));
    }

    #[test]
    fn truncates_long_cause_with_ellipsis() {
        let long = "a".repeat(600);
        let c = classify(&long);
        assert!(c.cause.ends_with("..."));
        assert!(c.cause.len() < long.len());
    }
}
