//! `drover run`: build every adapter from resolved config, recover
//! state from a prior interrupted run, build the task graph, and drive
//! the worker pool to completion.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use drover_adapters::{CliAgentRunner, CliTaskManager, ContainerCloneManager, ContainerConfig, GitVcsFactory, WorktreeCloneManager};
use drover_core::adapters::{CloneManager, EventSink, TaskManager, VcsFactory};
use drover_core::events::{FanoutSink, FileSink, StreamSink, StreamSinkConfig};
use drover_core::graph::TaskGraph;
use drover_core::lifecycle::LifecycleConfig;
use drover_core::lock::LandingLock;
use drover_core::state_store::{self, StateStore};
use drover_core::worker::{run_worker_pool, WorkerPoolConfig, WorkerPoolDeps, WorkerPoolOutcome};

use crate::agent_files::install_agent_files;
use crate::config::{Isolation, ResolvedConfig};
use crate::progress::TextProgressSink;
use crate::shutdown::install_shutdown_handler;

pub async fn run(config: ResolvedConfig) -> Result<()> {
    println!("drover run: parent={} repo_root={}", config.parent_id, config.repo_root.display());
    println!(
        "  concurrency={} require_review={} merge_on_success={} backend={} isolation={}",
        config.concurrency, config.require_review, config.merge_on_success, config.backend, config.isolation
    );

    let installed = install_agent_files(&config.repo_root)?;
    if installed {
        println!("  installed AGENTS.md into {}", config.repo_root.display());
    }

    let tracker: Arc<dyn TaskManager> = Arc::new(CliTaskManager::new());
    let runner = Arc::new(CliAgentRunner::with_binary(config.backend.clone()));

    let worktree_base = config.repo_root.join(".drover").join("worktrees");
    let (vcs_factory, clones): (Arc<dyn VcsFactory>, Arc<dyn CloneManager>) = match config.isolation {
        Isolation::Git => {
            let factory = GitVcsFactory::new(&config.repo_root, &worktree_base)
                .with_context(|| format!("{} is not a git repository", config.repo_root.display()))?;
            let clones = WorktreeCloneManager::new(&config.repo_root, &worktree_base)
                .with_context(|| format!("{} is not a git repository", config.repo_root.display()))?;
            (Arc::new(factory), Arc::new(clones))
        }
        Isolation::Container => {
            let factory = GitVcsFactory::new(&config.repo_root, &worktree_base)
                .with_context(|| format!("{} is not a git repository", config.repo_root.display()))?;
            let worktrees = WorktreeCloneManager::new(&config.repo_root, &worktree_base)
                .with_context(|| format!("{} is not a git repository", config.repo_root.display()))?;
            let container_config = ContainerConfig { image: "drover-agent:latest".to_string(), extra_flags: Vec::new() };
            let clones = ContainerCloneManager::new(container_config, worktrees);
            (Arc::new(factory), Arc::new(clones))
        }
    };

    let sink = build_event_sink(&config).await?;

    let state_store = StateStore::new(&config.scheduler_state_path);
    state_store::recover(&state_store, &config.parent_id, tracker.as_ref())
        .await
        .context("failed to recover scheduler state from a prior interrupted run")?;

    let (tasks, relations) = tracker
        .get_task_tree(&config.parent_id)
        .await
        .context("failed to load task tree from tracker")?;
    let mut graph = TaskGraph::build(&config.parent_id, tasks, relations).context("failed to build task graph")?;

    let pool_config = WorkerPoolConfig {
        parent_id: config.parent_id.clone(),
        max_workers: config.concurrency,
        cpu_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        max_tasks: config.max_tasks,
        lifecycle: LifecycleConfig {
            require_review: config.require_review,
            merge_on_success: config.merge_on_success,
            max_retries: config.max_retries,
            runner_timeout: config.runner_timeout,
            model: config.model.clone(),
            heartbeat_interval: config.watchdog_interval,
            stall_warning_threshold: config.watchdog_timeout,
        },
    };

    let deps = WorkerPoolDeps {
        tracker: tracker.clone(),
        runner,
        vcs_factory,
        clones,
        sink,
        landing_lock: LandingLock::new(),
        state_store,
        repo_root: config.repo_root.clone(),
    };

    let cancel = CancellationToken::new();
    install_shutdown_handler(cancel.clone());

    if config.dry_run {
        println!("dry run: {} task(s) in scope, not executing", graph.len());
        return Ok(());
    }

    let outcome = run_worker_pool(&mut graph, &deps, &pool_config, &cancel).await;

    match outcome {
        WorkerPoolOutcome::Completed => {
            println!("\nrun complete: all tasks reached a terminal state.");
            Ok(())
        }
        WorkerPoolOutcome::Stalled { stuck_tasks } => {
            println!("\nrun stalled: no remaining task is schedulable.");
            for id in &stuck_tasks {
                println!("  - {id}");
            }
            std::process::exit(1);
        }
        WorkerPoolOutcome::IncompleteGraph { stuck_tasks } => {
            eprintln!(
                "\nerror: tracker reports the task graph is not complete, but no task in this snapshot is schedulable."
            );
            for id in &stuck_tasks {
                eprintln!("  - {id}");
            }
            std::process::exit(1);
        }
        WorkerPoolOutcome::Interrupted => {
            println!("\nrun interrupted: in-flight tasks drained.");
            println!("re-run `drover run --parent-id {}` to resume.", config.parent_id);
            std::process::exit(130);
        }
        WorkerPoolOutcome::TaskLimitReached { remaining } => {
            println!("\nrun stopped: --max-tasks reached with {} task(s) still schedulable.", remaining.len());
            for id in &remaining {
                println!("  - {id}");
            }
            println!("re-run `drover run --parent-id {}` to continue.", config.parent_id);
            std::process::exit(0);
        }
    }
}

async fn build_event_sink(config: &ResolvedConfig) -> Result<Arc<dyn EventSink>> {
    let log_dir = config.scheduler_state_path.parent().unwrap_or_else(|| std::path::Path::new(".")).join("events");
    let log_path = log_dir.join(format!("{}.jsonl", config.parent_id));
    let file_sink: Arc<dyn EventSink> = Arc::new(FileSink::open(&log_path).await.with_context(|| format!("failed to open event log at {}", log_path.display()))?);

    let stdout_stream: Arc<dyn EventSink> = Arc::new(StreamSink::new(tokio::io::stdout(), StreamSinkConfig::default()));
    let progress: Arc<dyn EventSink> = Arc::new(TextProgressSink::new());

    Ok(Arc::new(FanoutSink::new(vec![file_sink, stdout_stream, progress])))
}
