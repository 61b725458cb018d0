//! Task identity, status, and edge kinds shared across the engine.
//!
//! Uses hand-written `Display`/`FromStr`
//! for small enums rather than a derive macro, so parse failures carry a
//! message naming the offending value.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A task's lifecycle status as seen by the tracker.
///
/// Terminal states are `Closed`, `Failed`, and `Blocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
    Failed,
}

impl TaskStatus {
    /// Terminal states are {closed, failed, blocked}.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Closed | TaskStatus::Failed | TaskStatus::Blocked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Closed => "closed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Error returned when a status string does not match any known variant.
#[derive(Debug, thiserror::Error)]
#[error("invalid task status {0:?} (expected one of: open, in_progress, blocked, closed, failed)")]
pub struct TaskStatusParseError(pub String);

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TaskStatus::Open),
            "in_progress" => Ok(TaskStatus::InProgress),
            "blocked" => Ok(TaskStatus::Blocked),
            "closed" => Ok(TaskStatus::Closed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(TaskStatusParseError(other.to_string())),
        }
    }
}

/// The kind of edge connecting two task ids in the graph.
///
/// `Blocks(a, b)` is normalized to `DependsOn(b, a)` at graph-build time
/// (see [`crate::graph::BuildGraph`]) and never stored as its own
/// adjacency; this variant exists only so callers can describe input
/// relations in whichever direction their tracker speaks natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Parent,
    DependsOn,
    Blocks,
}

/// A single task relation as reported by the tracker, before graph
/// construction normalizes it.
#[derive(Debug, Clone)]
pub struct TaskRelation {
    pub kind: EdgeKind,
    pub from: String,
    pub to: String,
}

/// A task as reported by the tracker.
///
/// `metadata` holds both adapter-specific data and scheduler-written
/// triage fields (`triage_status`, `triage_reason`, `review_verdict`,
/// `review_fail_feedback`, `review_retry_count`, `auto_commit_sha`,
/// `priority`). A `BTreeMap` is used (not a `HashMap`) so iteration and
/// serialization are deterministic without a later sort pass.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub parent: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Task {
    /// Default priority when no `priority` metadata key is present.
    pub const DEFAULT_PRIORITY: i64 = 2;

    /// Parse the `priority` metadata field as a signed integer.
    ///
    /// Per spec: unparseable -> 0. Missing -> [`Task::DEFAULT_PRIORITY`].
    pub fn priority(&self) -> i64 {
        match self.metadata.get("priority") {
            None => Self::DEFAULT_PRIORITY,
            Some(raw) => raw.trim().parse::<i64>().unwrap_or(0),
        }
    }
}

/// Normalize an id for comparison: trim whitespace. Two ids with equal
/// trimmed content are treated as the same node ("dedupe with
/// equal-content tolerance").
pub fn normalize_id(id: &str) -> String {
    id.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_display_and_parse() {
        for status in [
            TaskStatus::Open,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Closed,
            TaskStatus::Failed,
        ] {
            let s = status.to_string();
            assert_eq!(s.parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn rejects_unknown_status() {
        let err = "pending".parse::<TaskStatus>().unwrap_err();
        assert!(err.to_string().contains("pending"));
    }

    #[test]
    fn terminal_states_are_closed_failed_blocked() {
        assert!(TaskStatus::Closed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Open.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn priority_defaults_to_two_when_missing() {
        let t = Task {
            id: "t-1".into(),
            title: "t".into(),
            description: String::new(),
            status: TaskStatus::Open,
            parent: None,
            metadata: BTreeMap::new(),
        };
        assert_eq!(t.priority(), 2);
    }

    #[test]
    fn priority_is_zero_when_unparseable() {
        let mut md = BTreeMap::new();
        md.insert("priority".to_string(), "urgent".to_string());
        let t = Task {
            id: "t-1".into(),
            title: "t".into(),
            description: String::new(),
            status: TaskStatus::Open,
            parent: None,
            metadata: md,
        };
        assert_eq!(t.priority(), 0);
    }

    #[test]
    fn priority_parses_negative_values() {
        let mut md = BTreeMap::new();
        md.insert("priority".to_string(), "-1".to_string());
        let t = Task {
            id: "t-1".into(),
            title: "t".into(),
            description: String::new(),
            status: TaskStatus::Open,
            parent: None,
            metadata: md,
        };
        assert_eq!(t.priority(), -1);
    }
}
