//! Concrete adapters implementing `drover-core`'s traits against real
//! git, Docker, a `claude`-style CLI agent, and a generic JSON-emitting
//! tracker CLI.

pub mod container;
pub mod git;
pub mod runner;
pub mod tracker;

pub use container::{ContainerCloneManager, ContainerConfig};
pub use git::{GitError, GitVcs, GitVcsFactory, WorktreeCloneManager};
pub use runner::CliAgentRunner;
pub use tracker::CliTaskManager;
