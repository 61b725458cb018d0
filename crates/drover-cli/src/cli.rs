//! `drover`'s command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "drover", about = "Autonomous coding agent driver: scheduling, isolation, and landing")]
pub struct Cli {
    /// Increase log verbosity (stacks: -v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Explicit tracing filter, e.g. "drover_core=debug,info". Overrides -v.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler to completion (or stall/interruption) for one root task.
    Run(RunArgs),
    /// Write a drover config file with defaults, without running anything.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Install the static agent-instructions file into a repo root.
    InstallAgentFiles {
        /// Repository root to install into (defaults to the resolved repo_root).
        #[arg(long)]
        repo_root: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
    /// Root/parent task id that anchors scheduling (required).
    #[arg(long)]
    pub parent_id: Option<String>,

    /// Maximum number of concurrently running tasks (> 0).
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Stop after this many tasks have reached a terminal state.
    #[arg(long)]
    pub max_tasks: Option<usize>,

    /// Shared retry budget for implement/review remediation loops.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Require a passing review run before a task may land.
    #[arg(long)]
    pub require_review: Option<bool>,

    /// Merge a closed task's branch back into main automatically.
    #[arg(long)]
    pub merge_on_success: Option<bool>,

    /// Report what would run without invoking the agent or VCS.
    #[arg(long)]
    pub dry_run: bool,

    /// Per-run agent timeout, in seconds (>= 0).
    #[arg(long)]
    pub runner_timeout_secs: Option<u64>,

    /// Stall-detection timeout, in seconds (> 0).
    #[arg(long)]
    pub watchdog_timeout_secs: Option<u64>,

    /// Stall-detection poll interval, in seconds (> 0).
    #[arg(long)]
    pub watchdog_interval_secs: Option<u64>,

    /// Bound on implement-failure retries independent of review remediation.
    #[arg(long)]
    pub retry_budget: Option<u32>,

    /// Agent backend to invoke, e.g. "claude", "codex" (resolved to a CLI binary name).
    #[arg(long)]
    pub backend: Option<String>,

    /// Clone isolation mechanism: "git" (worktrees) or "container" (Docker).
    #[arg(long)]
    pub isolation: Option<String>,

    /// Agent backend model identifier, passed through to the runner.
    #[arg(long)]
    pub model: Option<String>,

    /// Named agent/auth profile, passed through to the runner.
    #[arg(long)]
    pub profile: Option<String>,

    /// Path to the repository to schedule against.
    #[arg(long)]
    pub repo_root: Option<PathBuf>,

    /// Path to the scheduler state JSON file.
    #[arg(long)]
    pub scheduler_state_path: Option<PathBuf>,
}
