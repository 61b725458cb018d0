//! Minimal fakes for `drover-core`'s adapter traits plus a real temp-git
//! fixture builder, for use in scenario and integration tests outside
//! the crate that cannot reach its `#[cfg(test)]` doubles.
//!
//! Each fake is a small struct with hardcoded or scripted returns -- no
//! attempt is made to model real tracker/VCS/runner semantics beyond
//! what a test needs to assert against.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use drover_core::adapters::{
    AdapterError, AdapterResult, AgentRunner, CloneManager, EventSink, MergeOutcome, RunnerRequest,
    RunnerResult, TaskManager, Vcs, VcsFactory,
};
use drover_core::events::Event;
use drover_core::graph::TaskSummary;
use drover_core::task::{Task, TaskRelation, TaskStatus};
use tokio::sync::Mutex;

/// In-memory tracker over a fixed task set. `next_tasks` reports every
/// task whose status is still `Open`, sorted by priority then id.
pub struct FakeTaskManager {
    tasks: Mutex<BTreeMap<String, Task>>,
    relations: Vec<TaskRelation>,
    is_complete_override: StdMutex<Option<bool>>,
}

impl FakeTaskManager {
    pub fn new(tasks: Vec<Task>, relations: Vec<TaskRelation>) -> Self {
        let tasks = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        FakeTaskManager { tasks: Mutex::new(tasks), relations, is_complete_override: StdMutex::new(None) }
    }

    pub async fn snapshot(&self) -> BTreeMap<String, Task> {
        self.tasks.lock().await.clone()
    }

    /// Scripts the `IsComplete` oracle's return value for tests. Leave
    /// unset (the `new` default) to model an adapter that doesn't
    /// implement the optional capability.
    pub fn with_is_complete(self, value: Option<bool>) -> Self {
        *self.is_complete_override.lock().unwrap() = value;
        self
    }
}

#[async_trait]
impl TaskManager for FakeTaskManager {
    async fn next_tasks(&self, _parent: &str) -> AdapterResult<Vec<TaskSummary>> {
        let tasks = self.tasks.lock().await;
        let mut ready: Vec<TaskSummary> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Open)
            .map(|t| TaskSummary { id: t.id.clone(), title: t.title.clone(), priority: t.priority() })
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(ready)
    }

    async fn get_task(&self, id: &str) -> AdapterResult<Task> {
        self.tasks
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::Tracker(format!("no such task {id}")))
    }

    async fn set_task_status(&self, id: &str, status: TaskStatus) -> AdapterResult<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(id).ok_or_else(|| AdapterError::Tracker(format!("no such task {id}")))?;
        task.status = status;
        Ok(())
    }

    async fn set_task_data(&self, id: &str, data: BTreeMap<String, String>) -> AdapterResult<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(id).ok_or_else(|| AdapterError::Tracker(format!("no such task {id}")))?;
        task.metadata.extend(data);
        Ok(())
    }

    async fn get_task_tree(&self, _parent: &str) -> AdapterResult<(Vec<Task>, Vec<TaskRelation>)> {
        let tasks: Vec<Task> = self.tasks.lock().await.values().cloned().collect();
        Ok((tasks, self.relations.clone()))
    }

    async fn is_complete(&self, _parent: &str) -> AdapterResult<Option<bool>> {
        Ok(*self.is_complete_override.lock().unwrap())
    }
}

/// A runner that returns a pre-scripted queue of results regardless of
/// request contents, recording every request it receives.
pub struct FakeAgentRunner {
    results: StdMutex<VecDeque<RunnerResult>>,
    requests: StdMutex<Vec<RunnerRequest>>,
}

impl FakeAgentRunner {
    pub fn new(results: Vec<RunnerResult>) -> Self {
        FakeAgentRunner { results: StdMutex::new(results.into()), requests: StdMutex::new(Vec::new()) }
    }

    pub fn requests(&self) -> Vec<RunnerRequest> {
        // RunnerRequest carries a boxed progress callback, not Clone;
        // tests that need request contents should snapshot prompts
        // instead. This drains the buffer.
        std::mem::take(&mut *self.requests.lock().unwrap())
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentRunner for FakeAgentRunner {
    fn name(&self) -> &str {
        "fake"
    }

    async fn run(&self, request: RunnerRequest) -> AdapterResult<RunnerResult> {
        self.requests.lock().unwrap().push(request);
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AdapterError::Runner("fake runner exhausted its script".to_string()))
    }
}

/// Records every call it receives and returns a fixed, configurable
/// response for each. A fresh `RecordingVcs` always reports clean
/// merges; use the `with_*` setters to script failures.
pub struct RecordingVcs {
    pub calls: StdMutex<Vec<String>>,
    merge_result: StdMutex<VecDeque<AdapterResult<MergeOutcome>>>,
}

impl RecordingVcs {
    pub fn new() -> Self {
        RecordingVcs { calls: StdMutex::new(Vec::new()), merge_result: StdMutex::new(VecDeque::new()) }
    }

    pub fn script_merge(&self, result: AdapterResult<MergeOutcome>) {
        self.merge_result.lock().unwrap().push_back(result);
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

impl Default for RecordingVcs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Vcs for RecordingVcs {
    async fn ensure_main(&self) -> AdapterResult<()> {
        self.record("ensure_main");
        Ok(())
    }

    async fn create_task_branch(&self, task_id: &str) -> AdapterResult<String> {
        self.record("create_task_branch");
        Ok(format!("drover/{task_id}"))
    }

    async fn checkout(&self, _reference: &str) -> AdapterResult<()> {
        self.record("checkout");
        Ok(())
    }

    async fn commit_all(&self, _message: &str) -> AdapterResult<String> {
        self.record("commit_all");
        Ok("deadbeef".to_string())
    }

    async fn merge_to_main(&self, _branch: &str) -> AdapterResult<MergeOutcome> {
        self.record("merge_to_main");
        match self.merge_result.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(MergeOutcome::Success),
        }
    }

    async fn push_branch(&self, _branch: &str) -> AdapterResult<()> {
        self.record("push_branch");
        Ok(())
    }

    async fn push_main(&self) -> AdapterResult<()> {
        self.record("push_main");
        Ok(())
    }
}

/// Hands out a fresh [`RecordingVcs`] per clone path, keeping them
/// keyed so a test can inspect the one a given clone used.
pub struct RecordingVcsFactory;

impl VcsFactory for RecordingVcsFactory {
    fn for_clone(&self, _clone_path: &Path) -> Box<dyn Vcs> {
        Box::new(RecordingVcs::new())
    }
}

/// A clone manager that does no actual filesystem work: it hands back
/// `repo_root` joined with the task id and records calls.
pub struct RecordingCloneManager {
    pub calls: StdMutex<Vec<String>>,
}

impl RecordingCloneManager {
    pub fn new() -> Self {
        RecordingCloneManager { calls: StdMutex::new(Vec::new()) }
    }
}

impl Default for RecordingCloneManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloneManager for RecordingCloneManager {
    async fn clone_for_task(&self, task_id: &str, repo_root: &Path) -> AdapterResult<PathBuf> {
        self.calls.lock().unwrap().push(format!("clone_for_task:{task_id}"));
        Ok(repo_root.join(task_id))
    }

    async fn cleanup(&self, task_id: &str) -> AdapterResult<()> {
        self.calls.lock().unwrap().push(format!("cleanup:{task_id}"));
        Ok(())
    }
}

/// Collects every emitted event for later inspection.
pub struct RecordingEventSink {
    events: StdMutex<Vec<Event>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        RecordingEventSink { events: StdMutex::new(Vec::new()) }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for RecordingEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn emit(&self, event: Event) -> AdapterResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// A throwaway git repository with one commit on `main`, for adapters
/// and scenario tests that need a real working tree to branch/merge
/// against. Synchronous: meant to be called from test setup, not from
/// inside an async scheduler run.
pub fn create_temp_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("create temp dir");
    let run = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir.path())
            .status()
            .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
        assert!(status.success(), "git {args:?} failed");
    };

    run(&["init", "--initial-branch=main"]);
    run(&["config", "user.email", "drover-test@example.com"]);
    run(&["config", "user.name", "Drover Test"]);
    std::fs::write(dir.path().join("README.md"), "drover test fixture\n").expect("write readme");
    run(&["add", "."]);
    run(&["commit", "-m", "initial commit"]);

    dir
}
