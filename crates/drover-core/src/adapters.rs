//! Adapter interfaces the engine is polymorphic over.
//!
//! Small, object-safe, `Send + Sync` async traits so the loop can hold
//! a `Box<dyn Trait>`/`Arc<dyn Trait>` without knowing the concrete
//! backend. Optional capabilities (`CalculateConcurrency`, `IsComplete`)
//! are feature-detected via a method returning `Option<_>` rather than a
//! separate marker trait, since object-safe traits can't carry
//! associated-const capability flags cleanly.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::graph::TaskSummary;
use crate::task::Task;

/// Mode a runner request executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerMode {
    Implement,
    Review,
}

/// Coarse outcome of a runner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Completed,
    Blocked,
    Failed,
}

/// A progress event pushed from the runner's execution thread while a
/// request is in flight. The receiver must be safe to invoke from
/// another thread and must not block long enough to starve the runner
/// -- callers typically forward these into a bounded `mpsc` channel
/// rather than doing synchronous work inline.
#[derive(Debug, Clone)]
pub enum RunnerProgress {
    Output(String),
    CommandStarted { command: String },
    CommandFinished { command: String, exit_code: Option<i32> },
    Heartbeat,
}

pub type ProgressStream = Pin<Box<dyn Stream<Item = RunnerProgress> + Send>>;

/// A callback invoked for each [`RunnerProgress`] event. Boxed so
/// concrete runners don't need a generic parameter.
pub type ProgressCallback = Box<dyn Fn(RunnerProgress) + Send + Sync>;

/// Request passed to [`AgentRunner::run`].
pub struct RunnerRequest {
    pub task_id: String,
    pub parent_id: String,
    pub prompt: String,
    pub mode: RunnerMode,
    pub model: Option<String>,
    pub repo_root: PathBuf,
    pub timeout: Duration,
    pub metadata: BTreeMap<String, String>,
    pub on_progress: Option<ProgressCallback>,
}

/// Result returned by [`AgentRunner::run`].
#[derive(Debug, Clone)]
pub struct RunnerResult {
    pub status: RunnerStatus,
    pub reason: Option<String>,
    pub log_path: Option<PathBuf>,
    /// e.g. `review_verdict`, `review_fail_feedback`, `stall_category`,
    /// `session_id`, `last_output_age`.
    pub artifacts: BTreeMap<String, String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub review_ready: bool,
}

/// Outcome of a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Success,
    Conflict { details: String },
}

/// Errors an adapter call can surface. The engine never inspects these
/// beyond classifying them (see [`crate::errors`]); adapters are free to
/// carry richer context in the `String`.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("tracker error: {0}")]
    Tracker(String),
    #[error("vcs error: {0}")]
    Vcs(String),
    #[error("clone error: {0}")]
    Clone(String),
    #[error("runner error: {0}")]
    Runner(String),
    #[error("event sink error: {0}")]
    Sink(String),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Operations the scheduler consumes from the task tracker.
#[async_trait]
pub trait TaskManager: Send + Sync {
    /// Ready task summaries for `parent` -- may be the engine's own ready
    /// set or an adapter-native equivalent.
    async fn next_tasks(&self, parent: &str) -> AdapterResult<Vec<TaskSummary>>;

    /// Full task record, or a not-found error.
    async fn get_task(&self, id: &str) -> AdapterResult<Task>;

    /// Persist a new status. Must be idempotent on same-status writes.
    async fn set_task_status(&self, id: &str, status: crate::task::TaskStatus) -> AdapterResult<()>;

    /// Merge key/value metadata; last-write-wins per key.
    async fn set_task_data(&self, id: &str, data: BTreeMap<String, String>) -> AdapterResult<()>;

    /// Full task tree rooted at `parent`, used to (re)build the
    /// in-memory graph.
    async fn get_task_tree(
        &self,
        parent: &str,
    ) -> AdapterResult<(Vec<Task>, Vec<crate::task::TaskRelation>)>;

    /// Optional capability: adapter-aware completion oracle. `None` means
    /// the adapter does not implement this; the caller falls back to the
    /// engine's own `IsComplete`.
    async fn is_complete(&self, _parent: &str) -> AdapterResult<Option<bool>> {
        Ok(None)
    }
}

/// Executes a prompt against a repository clone.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, request: RunnerRequest) -> AdapterResult<RunnerResult>;
}

/// Branch/checkout/commit/merge/push operations against a repository
/// root. A `VCS` instance is scoped to one repository path for its
/// lifetime.
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn ensure_main(&self) -> AdapterResult<()>;
    async fn create_task_branch(&self, task_id: &str) -> AdapterResult<String>;
    async fn checkout(&self, reference: &str) -> AdapterResult<()>;
    async fn commit_all(&self, message: &str) -> AdapterResult<String>;
    async fn merge_to_main(&self, branch: &str) -> AdapterResult<MergeOutcome>;
    async fn push_branch(&self, branch: &str) -> AdapterResult<()>;
    async fn push_main(&self) -> AdapterResult<()>;
}

/// Optional factory for constructing a task-scoped [`Vcs`]. When
/// absent, the lifecycle falls back to a single repo-root-scoped `Vcs`
/// shared across tasks.
pub trait VcsFactory: Send + Sync {
    fn for_clone(&self, clone_path: &std::path::Path) -> Box<dyn Vcs>;
}

/// Materializes and disposes per-task repository clones.
#[async_trait]
pub trait CloneManager: Send + Sync {
    async fn clone_for_task(&self, task_id: &str, repo_root: &std::path::Path) -> AdapterResult<PathBuf>;
    async fn cleanup(&self, task_id: &str) -> AdapterResult<()>;
}

/// Sink for structured lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: crate::events::Event) -> AdapterResult<()>;
}
