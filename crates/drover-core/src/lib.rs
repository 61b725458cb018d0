//! Pure scheduling/lifecycle engine: dependency graph, worker pool,
//! per-task lifecycle, landing queue, event pipeline, and state store.
//! Every external effect (tracker, VCS, runner, clone, event delivery)
//! is reached through a trait in [`adapters`] -- this crate never shells
//! out or touches a filesystem path other than the scheduler state
//! file.

pub mod adapters;
pub mod errors;
pub mod events;
pub mod graph;
pub mod landing;
pub mod lifecycle;
pub mod lock;
pub mod prompt;
pub mod state_store;
pub mod task;
pub mod worker;

pub use adapters::{
    AdapterError, AdapterResult, AgentRunner, CloneManager, EventSink, MergeOutcome, RunnerMode,
    RunnerProgress, RunnerRequest, RunnerResult, RunnerStatus, TaskManager, Vcs, VcsFactory,
};
pub use events::{Event, EventType, FanoutSink, FileSink, StreamSink, StreamSinkConfig};
pub use graph::{ConcurrencyOpts, TaskGraph, TaskSummary};
pub use landing::{LandOutcome, LandRequest, MergeRemediator};
pub use lifecycle::{LifecycleConfig, LifecycleContext, LifecycleError, LifecycleOutcome};
pub use lock::{LandingLock, TaskClaim, TaskLock};
pub use task::{Task, TaskStatus};
pub use worker::{WorkerPoolConfig, WorkerPoolOutcome};
