//! Git-backed VCS and worktree clone manager.
//!
//! All mutating git operations run through `spawn_blocking` since the
//! `git2`-free implementation here just shells out to the `git` binary
//! with `std::process::Command`, and are serialized per repository
//! through an internal mutex -- git takes its own lock on the shared
//! object store and two concurrent `git worktree add`/`git merge`
//! invocations against the same repo can otherwise race on it.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use drover_core::adapters::{AdapterError, AdapterResult, CloneManager, MergeOutcome, Vcs, VcsFactory};

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),
    #[error("failed to run git {command}: {source}")]
    Spawn { command: String, source: std::io::Error },
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit { command: String, code: i32, stderr: String },
}

impl From<GitError> for AdapterError {
    fn from(e: GitError) -> Self {
        AdapterError::Vcs(e.to_string())
    }
}

/// Serializes git invocations against one repository and exposes the
/// primitive operations [`GitVcs`] and [`WorktreeCloneManager`] build on.
#[derive(Clone)]
struct GitRepo {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl GitRepo {
    fn new(repo_path: PathBuf, worktree_base: PathBuf) -> Result<Self, GitError> {
        let status = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| GitError::Spawn { command: "rev-parse".into(), source: e })?;
        if !status.status.success() {
            return Err(GitError::NotAGitRepo(repo_path));
        }
        Ok(GitRepo { repo_path, worktree_base, lock: Arc::new(Mutex::new(())) })
    }

    fn run(&self, args: &[&str], cwd: &Path) -> Result<std::process::Output, GitError> {
        Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|e| GitError::Spawn { command: args.join(" "), source: e })
    }

    fn run_ok(&self, args: &[&str], cwd: &Path) -> Result<(), GitError> {
        let output = self.run(args, cwd)?;
        if output.status.success() {
            return Ok(());
        }
        Err(GitError::Exit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let output = self.run(&["rev-parse", "--verify", "--quiet", branch], &self.repo_path)?;
        Ok(output.status.success())
    }

    fn worktree_path(&self, branch: &str) -> PathBuf {
        self.worktree_base.join(branch.replace('/', "--"))
    }

    fn create_worktree(&self, branch: &str) -> Result<PathBuf, GitError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.worktree_path(branch);

        if path.exists() {
            return Ok(path);
        }
        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| GitError::Spawn {
                command: "mkdir worktree_base".into(),
                source: e,
            })?;
        }

        if self.branch_exists(branch)? {
            self.run_ok(&["worktree", "add", path.to_str().unwrap_or_default(), branch], &self.repo_path)?;
        } else {
            self.run_ok(
                &["worktree", "add", "-b", branch, path.to_str().unwrap_or_default()],
                &self.repo_path,
            )?;
        }
        Ok(path)
    }

    fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let output = self.run(&["worktree", "remove", "--force", path.to_str().unwrap_or_default()], &self.repo_path)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.contains("is not a working tree") {
            return Ok(());
        }
        Err(GitError::Exit { command: "worktree remove".into(), code: output.status.code().unwrap_or(-1), stderr })
    }

    fn merge(&self, cwd: &Path, branch: &str) -> Result<MergeOutcome, GitError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let output = self.run(&["merge", "--no-ff", branch], cwd)?;
        if output.status.success() {
            return Ok(MergeOutcome::Success);
        }
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.contains("CONFLICT") || stdout.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let _ = self.run(&["merge", "--abort"], cwd);
            return Ok(MergeOutcome::Conflict { details: format!("{stdout}\n{stderr}").trim().to_string() });
        }
        Err(GitError::Exit { command: "merge".into(), code: output.status.code().unwrap_or(-1), stderr })
    }
}

/// Per-clone VCS backed by a shared repository's git plumbing. `root`
/// is the shared main repo; `cwd` is whatever path (main checkout or
/// worktree) this instance operates in.
pub struct GitVcs {
    repo: GitRepo,
    cwd: PathBuf,
}

#[async_trait]
impl Vcs for GitVcs {
    async fn ensure_main(&self) -> AdapterResult<()> {
        let repo = self.repo.clone();
        tokio::task::spawn_blocking(move || repo.run_ok(&["checkout", "main"], &repo.repo_path.clone()))
            .await
            .map_err(|e| AdapterError::Vcs(format!("ensure_main join error: {e}")))?
            .map_err(AdapterError::from)
    }

    async fn create_task_branch(&self, task_id: &str) -> AdapterResult<String> {
        let branch = format!("drover/{task_id}");
        let repo = self.repo.clone();
        let branch_clone = branch.clone();
        tokio::task::spawn_blocking(move || repo.create_worktree(&branch_clone))
            .await
            .map_err(|e| AdapterError::Vcs(format!("create_task_branch join error: {e}")))?
            .map_err(AdapterError::from)?;
        Ok(branch)
    }

    async fn checkout(&self, reference: &str) -> AdapterResult<()> {
        let repo = self.repo.clone();
        let cwd = self.cwd.clone();
        let reference = reference.to_string();
        tokio::task::spawn_blocking(move || repo.run_ok(&["checkout", &reference], &cwd))
            .await
            .map_err(|e| AdapterError::Vcs(format!("checkout join error: {e}")))?
            .map_err(AdapterError::from)
    }

    async fn commit_all(&self, message: &str) -> AdapterResult<String> {
        let repo = self.repo.clone();
        let cwd = self.cwd.clone();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || -> Result<String, GitError> {
            repo.run_ok(&["add", "-A"], &cwd)?;
            let status = repo.run(&["status", "--porcelain"], &cwd)?;
            if status.stdout.is_empty() {
                let head = repo.run(&["rev-parse", "HEAD"], &cwd)?;
                return Ok(String::from_utf8_lossy(&head.stdout).trim().to_string());
            }
            repo.run_ok(&["commit", "-m", &message], &cwd)?;
            let head = repo.run(&["rev-parse", "HEAD"], &cwd)?;
            Ok(String::from_utf8_lossy(&head.stdout).trim().to_string())
        })
        .await
        .map_err(|e| AdapterError::Vcs(format!("commit_all join error: {e}")))?
        .map_err(AdapterError::from)
    }

    async fn merge_to_main(&self, branch: &str) -> AdapterResult<MergeOutcome> {
        let repo = self.repo.clone();
        let main_cwd = repo.repo_path.clone();
        let branch = branch.to_string();
        tokio::task::spawn_blocking(move || repo.merge(&main_cwd, &branch))
            .await
            .map_err(|e| AdapterError::Vcs(format!("merge_to_main join error: {e}")))?
            .map_err(AdapterError::from)
    }

    async fn push_branch(&self, branch: &str) -> AdapterResult<()> {
        let repo = self.repo.clone();
        let cwd = self.cwd.clone();
        let branch = branch.to_string();
        tokio::task::spawn_blocking(move || repo.run_ok(&["push", "origin", &branch], &cwd))
            .await
            .map_err(|e| AdapterError::Vcs(format!("push_branch join error: {e}")))?
            .map_err(AdapterError::from)
    }

    async fn push_main(&self) -> AdapterResult<()> {
        let repo = self.repo.clone();
        let cwd = repo.repo_path.clone();
        tokio::task::spawn_blocking(move || repo.run_ok(&["push", "origin", "main"], &cwd))
            .await
            .map_err(|e| AdapterError::Vcs(format!("push_main join error: {e}")))?
            .map_err(AdapterError::from)
    }
}

/// Constructs a [`GitVcs`] scoped to one repository, sharing its git
/// lock across every clone it hands out.
pub struct GitVcsFactory {
    repo: GitRepo,
}

impl GitVcsFactory {
    /// `repo_path` must already be a git repository; `worktree_base`
    /// holds the per-task worktrees this factory's clones live in.
    pub fn new(repo_path: impl Into<PathBuf>, worktree_base: impl Into<PathBuf>) -> Result<Self, GitError> {
        Ok(GitVcsFactory { repo: GitRepo::new(repo_path.into(), worktree_base.into())? })
    }
}

impl VcsFactory for GitVcsFactory {
    fn for_clone(&self, clone_path: &Path) -> Box<dyn Vcs> {
        Box::new(GitVcs { repo: self.repo.clone(), cwd: clone_path.to_path_buf() })
    }
}

/// Materializes one git worktree per task, removed again on cleanup.
pub struct WorktreeCloneManager {
    repo: GitRepo,
}

impl WorktreeCloneManager {
    pub fn new(repo_path: impl Into<PathBuf>, worktree_base: impl Into<PathBuf>) -> Result<Self, GitError> {
        Ok(WorktreeCloneManager { repo: GitRepo::new(repo_path.into(), worktree_base.into())? })
    }
}

#[async_trait]
impl CloneManager for WorktreeCloneManager {
    async fn clone_for_task(&self, task_id: &str, _repo_root: &Path) -> AdapterResult<PathBuf> {
        let repo = self.repo.clone();
        let branch = format!("drover/{task_id}");
        tokio::task::spawn_blocking(move || repo.create_worktree(&branch))
            .await
            .map_err(|e| AdapterError::Clone(format!("clone join error: {e}")))?
            .map_err(|e| AdapterError::Clone(e.to_string()))
    }

    async fn cleanup(&self, task_id: &str) -> AdapterResult<()> {
        let repo = self.repo.clone();
        let branch = format!("drover/{task_id}");
        let path = repo.worktree_path(&branch);
        tokio::task::spawn_blocking(move || repo.remove_worktree(&path))
            .await
            .map_err(|e| AdapterError::Clone(format!("cleanup join error: {e}")))?
            .map_err(|e| AdapterError::Clone(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_test_utils::create_temp_repo;

    #[tokio::test]
    async fn commit_all_is_a_noop_when_nothing_changed() {
        let repo_dir = create_temp_repo();
        let worktree_base = tempfile::tempdir().unwrap();
        let factory = GitVcsFactory::new(repo_dir.path(), worktree_base.path()).unwrap();
        let vcs = factory.for_clone(repo_dir.path());
        let sha1 = vcs.commit_all("first").await.unwrap();
        let sha2 = vcs.commit_all("second").await.unwrap();
        assert_eq!(sha1, sha2);
    }

    #[tokio::test]
    async fn worktree_clone_manager_creates_and_removes_a_worktree() {
        let repo_dir = create_temp_repo();
        let worktree_base = tempfile::tempdir().unwrap();
        let clones = WorktreeCloneManager::new(repo_dir.path(), worktree_base.path()).unwrap();
        let path = clones.clone_for_task("t-1", repo_dir.path()).await.unwrap();
        assert!(path.exists());
        clones.cleanup("t-1").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn merge_conflict_is_reported_not_errored() {
        let repo_dir = create_temp_repo();
        let worktree_base = tempfile::tempdir().unwrap();
        let clones = WorktreeCloneManager::new(repo_dir.path(), worktree_base.path()).unwrap();
        let factory = GitVcsFactory::new(repo_dir.path(), worktree_base.path()).unwrap();

        let clone_path = clones.clone_for_task("t-1", repo_dir.path()).await.unwrap();
        std::fs::write(clone_path.join("README.md"), "branch change\n").unwrap();
        let vcs = factory.for_clone(&clone_path);
        vcs.commit_all("branch change").await.unwrap();

        std::fs::write(repo_dir.path().join("README.md"), "main change\n").unwrap();
        let main_vcs = factory.for_clone(repo_dir.path());
        main_vcs.commit_all("main change").await.unwrap();

        let outcome = main_vcs.merge_to_main("drover/t-1").await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Conflict { .. }));
    }
}
