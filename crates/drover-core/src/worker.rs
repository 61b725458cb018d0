//! Bounded worker pool: claims ready tasks off the graph, runs each
//! through its full lifecycle on its own clone, and keeps the in-memory
//! graph and the durable state store in sync as attempts finish.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::adapters::{AgentRunner, CloneManager, EventSink, TaskManager, VcsFactory};
use crate::graph::{self, ConcurrencyOpts, TaskGraph};
use crate::lifecycle::{run_task_lifecycle, LifecycleConfig, LifecycleContext, LifecycleError, LifecycleOutcome};
use crate::lock::{LandingLock, TaskLock};
use crate::state_store::StateStore;
use crate::task::TaskStatus;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub parent_id: String,
    pub max_workers: usize,
    pub cpu_count: usize,
    /// Stop claiming new ready tasks once this many attempts have
    /// reached a terminal state; already in-flight attempts still run
    /// to completion. `None` means unbounded.
    pub max_tasks: Option<usize>,
    pub lifecycle: LifecycleConfig,
}

/// Adapters the pool drives. Held as `Arc` so each spawned attempt can
/// own a cheap clone that outlives the loop iteration that spawned it.
pub struct WorkerPoolDeps {
    pub tracker: Arc<dyn TaskManager>,
    pub runner: Arc<dyn AgentRunner>,
    pub vcs_factory: Arc<dyn VcsFactory>,
    pub clones: Arc<dyn CloneManager>,
    pub sink: Arc<dyn EventSink>,
    pub landing_lock: Arc<LandingLock>,
    pub state_store: Arc<StateStore>,
    pub repo_root: PathBuf,
}

#[derive(Debug, Clone)]
pub enum WorkerPoolOutcome {
    Completed,
    /// The graph is not complete but no remaining task is reachable --
    /// every unclosed task is blocked/failed itself or depends
    /// transitively on one that is.
    Stalled { stuck_tasks: Vec<String> },
    /// The ready set is empty and the in-memory graph looks stalled, but
    /// the tracker's optional `IsComplete` oracle reports `false` -- the
    /// adapter knows of outstanding work this graph snapshot doesn't
    /// reflect. Surfaced as an error rather than a clean "stalled" exit.
    IncompleteGraph { stuck_tasks: Vec<String> },
    Interrupted,
    /// `max_tasks` attempts were started and all of them finished, but
    /// the graph still has schedulable work left for a future run.
    TaskLimitReached { remaining: Vec<String> },
}

struct WorkerDone {
    task_id: String,
    result: Result<LifecycleOutcome, LifecycleError>,
}

/// Run the pool to completion, stall, or cancellation. `graph` is
/// mutated in place as attempts finish so the caller can inspect final
/// per-task status afterward.
pub async fn run_worker_pool(
    graph: &mut TaskGraph,
    deps: &WorkerPoolDeps,
    config: &WorkerPoolConfig,
    cancel: &CancellationToken,
) -> WorkerPoolOutcome {
    let permits = graph::calculate_concurrency(
        graph,
        ConcurrencyOpts { max_workers: config.max_workers, cpu_count: config.cpu_count },
    )
    .max(1);
    let semaphore = Arc::new(Semaphore::new(permits));
    let task_lock = TaskLock::new();
    let (tx, mut rx) = mpsc::channel::<WorkerDone>(permits.max(1));
    let mut in_flight: BTreeSet<String> = BTreeSet::new();
    let mut terminal_total: usize = 0;

    loop {
        if cancel.is_cancelled() {
            return drain_on_cancel(graph, &mut rx, in_flight).await;
        }

        while let Ok(done) = rx.try_recv() {
            in_flight.remove(&done.task_id);
            apply_result(graph, deps, &config.parent_id, &done).await;
            terminal_total += 1;
        }

        if graph::is_complete(graph) {
            return WorkerPoolOutcome::Completed;
        }

        let limit_reached = config.max_tasks.is_some_and(|max| terminal_total >= max);

        let mut spawned_any = false;
        if !limit_reached {
            for candidate in graph::get_next_available(graph) {
                if in_flight.contains(&candidate.id) {
                    continue;
                }
                let Some(claim) = task_lock.claim(&candidate.id).await else {
                    continue;
                };
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };

                in_flight.insert(candidate.id.clone());
                graph::update_task_status(graph, &candidate.id, TaskStatus::InProgress);
                record_in_flight(deps, &config.parent_id, &candidate.id, true).await;

                spawned_any = true;
                spawn_attempt(candidate.id, deps, config, tx.clone(), claim, permit);
            }
        }

        if !spawned_any && in_flight.is_empty() {
            if limit_reached {
                let remaining = graph::get_next_available(graph).into_iter().map(|t| t.id).collect();
                return WorkerPoolOutcome::TaskLimitReached { remaining };
            }
            let stuck = stuck_task_ids(graph);
            if let Ok(Some(false)) = deps.tracker.is_complete(&config.parent_id).await {
                return WorkerPoolOutcome::IncompleteGraph { stuck_tasks: stuck };
            }
            return WorkerPoolOutcome::Stalled { stuck_tasks: stuck };
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return drain_on_cancel(graph, &mut rx, in_flight).await;
            }
            Some(done) = rx.recv() => {
                in_flight.remove(&done.task_id);
                apply_result(graph, deps, &config.parent_id, &done).await;
                terminal_total += 1;
            }
            _ = tokio::time::sleep(Duration::from_millis(50)), if !spawned_any => {}
        }
    }
}

fn spawn_attempt(
    task_id: String,
    deps: &WorkerPoolDeps,
    config: &WorkerPoolConfig,
    tx: mpsc::Sender<WorkerDone>,
    claim: crate::lock::TaskClaim,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    let tracker = deps.tracker.clone();
    let runner = deps.runner.clone();
    let vcs_factory = deps.vcs_factory.clone();
    let clones = deps.clones.clone();
    let sink = deps.sink.clone();
    let landing_lock = deps.landing_lock.clone();
    let repo_root = deps.repo_root.clone();
    let parent_id = config.parent_id.clone();
    let lifecycle_config = config.lifecycle.clone();

    tokio::spawn(async move {
        let _claim = claim;
        let _permit = permit;

        let result = run_one_attempt(
            &task_id,
            tracker.as_ref(),
            runner.as_ref(),
            vcs_factory.as_ref(),
            clones.as_ref(),
            sink.as_ref(),
            &landing_lock,
            &repo_root,
            &parent_id,
            &lifecycle_config,
        )
        .await;

        let _ = tx.send(WorkerDone { task_id, result }).await;
    });
}

async fn run_one_attempt(
    task_id: &str,
    tracker: &dyn TaskManager,
    runner: &dyn AgentRunner,
    vcs_factory: &dyn VcsFactory,
    clones: &dyn CloneManager,
    sink: &dyn EventSink,
    landing_lock: &Arc<LandingLock>,
    repo_root: &std::path::Path,
    parent_id: &str,
    lifecycle_config: &LifecycleConfig,
) -> Result<LifecycleOutcome, LifecycleError> {
    let clone_path = clones
        .clone_for_task(task_id, repo_root)
        .await
        .map_err(LifecycleError::Adapter)?;
    let vcs = vcs_factory.for_clone(&clone_path);

    let task = tracker.get_task(task_id).await.map_err(LifecycleError::Adapter)?;

    let ctx = LifecycleContext {
        tracker,
        runner,
        vcs: vcs.as_ref(),
        sink,
        landing_lock,
        repo_root: clone_path,
        parent_id: parent_id.to_string(),
        config: lifecycle_config,
    };

    let outcome = run_task_lifecycle(&ctx, &task).await;
    let _ = clones.cleanup(task_id).await;
    outcome
}

async fn apply_result(graph: &mut TaskGraph, deps: &WorkerPoolDeps, parent_id: &str, done: &WorkerDone) {
    let status = match &done.result {
        Ok(LifecycleOutcome::Closed) => TaskStatus::Closed,
        Ok(LifecycleOutcome::Blocked { .. }) => TaskStatus::Blocked,
        Ok(LifecycleOutcome::Failed { .. }) => TaskStatus::Failed,
        Err(_) => TaskStatus::Open, // tracker write failed mid-lifecycle; leave for recovery to resolve.
    };
    graph::update_task_status(graph, &done.task_id, status);

    if let Ok(mut loaded) = deps.state_store.load(parent_id).await {
        loaded.snapshot.in_flight.remove(&done.task_id);
        match status {
            TaskStatus::Closed => {
                loaded.snapshot.completed.insert(done.task_id.clone());
            }
            TaskStatus::Blocked => {
                loaded.snapshot.blocked.insert(done.task_id.clone());
            }
            _ => {}
        }
        let _ = deps.state_store.save(&loaded).await;
    }
}

async fn record_in_flight(deps: &WorkerPoolDeps, parent_id: &str, task_id: &str, add: bool) {
    if let Ok(mut loaded) = deps.state_store.load(parent_id).await {
        if add {
            loaded.snapshot.in_flight.insert(task_id.to_string());
        } else {
            loaded.snapshot.in_flight.remove(task_id);
        }
        let _ = deps.state_store.save(&loaded).await;
    }
}

fn stuck_task_ids(graph: &TaskGraph) -> Vec<String> {
    graph
        .nodes()
        .filter(|n| !n.task.status.is_terminal() && n.task.id != graph.root)
        .map(|n| n.task.id.clone())
        .collect()
}

async fn drain_on_cancel(
    graph: &mut TaskGraph,
    rx: &mut mpsc::Receiver<WorkerDone>,
    in_flight: BTreeSet<String>,
) -> WorkerPoolOutcome {
    if in_flight.is_empty() {
        return WorkerPoolOutcome::Interrupted;
    }
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);
    let mut remaining = in_flight;
    loop {
        if remaining.is_empty() {
            break;
        }
        tokio::select! {
            _ = &mut deadline => break,
            Some(done) = rx.recv() => {
                remaining.remove(&done.task_id);
                let status = match &done.result {
                    Ok(LifecycleOutcome::Closed) => TaskStatus::Closed,
                    Ok(LifecycleOutcome::Blocked { .. }) => TaskStatus::Blocked,
                    Ok(LifecycleOutcome::Failed { .. }) => TaskStatus::Failed,
                    Err(_) => TaskStatus::Open,
                };
                graph::update_task_status(graph, &done.task_id, status);
            }
            else => break,
        }
    }
    WorkerPoolOutcome::Interrupted
}
