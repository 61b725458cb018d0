//! Per-task lifecycle state machine: one worker's attempt at one task,
//! from branch creation through implement/review/remediation to a
//! terminal landing or failure outcome.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::adapters::{
    AdapterResult, AgentRunner, EventSink, RunnerMode, RunnerRequest, RunnerResult, RunnerStatus,
    TaskManager, Vcs,
};
use crate::errors::classify;
use crate::events::{Event, EventType};
use crate::landing::{self, LandOutcome, LandRequest, MergeRemediator};
use crate::lock::LandingLock;
use crate::prompt::{build_implement_prompt, build_review_prompt, PriorFeedback};
use crate::task::{Task, TaskStatus};

/// Tunable policy for one task's lifecycle run.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub require_review: bool,
    pub merge_on_success: bool,
    /// Shared retry budget: bounds both generic implement-failure
    /// retries (`retry_count`) and review-remediation retries
    /// (`review_retry_count`), tracked as two distinct counters.
    pub max_retries: u32,
    pub runner_timeout: Duration,
    pub model: Option<String>,
    /// Interval between `runner_heartbeat` events while a runner call
    /// is in flight.
    pub heartbeat_interval: Duration,
    /// How long a runner call may go without emitting output before a
    /// `runner_warning` is raised. Purely observational -- does not
    /// affect `runner_timeout`, which still governs the hard deadline.
    pub stall_warning_threshold: Duration,
}

/// Terminal result of a lifecycle run, already reflected in the
/// tracker by the time this is returned.
#[derive(Debug, Clone)]
pub enum LifecycleOutcome {
    Closed,
    Blocked { reason: String },
    Failed { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("adapter call failed before a terminal outcome could be recorded: {0}")]
    Adapter(#[from] crate::adapters::AdapterError),
}

/// Everything one lifecycle run needs, borrowed for its duration.
pub struct LifecycleContext<'a> {
    pub tracker: &'a dyn TaskManager,
    pub runner: &'a dyn AgentRunner,
    pub vcs: &'a dyn Vcs,
    pub sink: &'a dyn EventSink,
    pub landing_lock: &'a Arc<LandingLock>,
    pub repo_root: PathBuf,
    pub parent_id: String,
    pub config: &'a LifecycleConfig,
}

/// Run one task through its full lifecycle: SELECTED -> BRANCH ->
/// IMPLEMENT -> [REVIEW loop] -> LAND_OR_CLOSE / RETRY_BUDGET ->
/// CLOSED | BLOCKED | FAILED.
pub async fn run_task_lifecycle(ctx: &LifecycleContext<'_>, task: &Task) -> Result<LifecycleOutcome, LifecycleError> {
    let task_id = task.id.as_str();

    emit(ctx.sink, Event::new(EventType::TaskStarted, task_id, Utc::now()).with_title(task.title.clone())).await;
    ctx.tracker.set_task_status(task_id, TaskStatus::InProgress).await?;

    let branch = match run_branch_step(ctx, task).await {
        Ok(branch) => branch,
        Err(e) => {
            let reason = classify(&e.to_string()).cause;
            return finish_failed(ctx, task, reason, None).await;
        }
    };

    let mut attempt: u32 = 0;
    let mut retry_count: u32 = 0;
    let mut review_retry_count: u32 = 0;
    let mut prior = PriorFeedback::None;

    loop {
        ctx.tracker.set_task_status(task_id, TaskStatus::InProgress).await?;

        let implement_result = run_implement_step(ctx, task, &prior, attempt).await;

        match implement_result {
            // Implement-mode failures are terminal for this task in this
            // release: no blind retry of unclassified failures. Only a
            // review-originated failure (routed through RETRY_BUDGET via
            // `ReviewDecision::GenericRetry`/`Remediate` below) may reopen
            // and re-implement.
            Err(e) => {
                let reason = classify(&e.to_string()).cause;
                return finish_failed(ctx, task, reason, None).await;
            }
            Ok(result) => match result.status {
                RunnerStatus::Blocked => {
                    let reason = result
                        .reason
                        .unwrap_or_else(|| "implement runner reported blocked".to_string());
                    return finish_blocked(ctx, task, reason, None).await;
                }
                RunnerStatus::Failed => {
                    let reason = result.reason.unwrap_or_else(|| "implement failed".to_string());
                    return finish_failed(ctx, task, reason, None).await;
                }
                RunnerStatus::Completed => {
                    if !ctx.config.require_review {
                        break;
                    }

                    match run_review(ctx, task, review_retry_count).await {
                        ReviewDecision::Land { .. } => break,
                        ReviewDecision::Remediate(feedback) => {
                            if review_retry_count < ctx.config.max_retries {
                                review_retry_count += 1;
                                attempt += 1;
                                prior = PriorFeedback::ReviewBlockers(feedback.clone());
                                continue;
                            }
                            let reason = format!("review rejected: {feedback}");
                            let review = ReviewTriage {
                                verdict: Some("fail".to_string()),
                                feedback: Some(feedback),
                                retry_count: Some(review_retry_count),
                            };
                            return finish_failed(ctx, task, reason, Some(review)).await;
                        }
                        ReviewDecision::GenericRetry(reason) => {
                            retry_count += 1;
                            if retry_count <= ctx.config.max_retries {
                                attempt += 1;
                                prior = PriorFeedback::None;
                                continue;
                            }
                            let review = ReviewTriage {
                                verdict: None,
                                feedback: None,
                                retry_count: Some(review_retry_count),
                            };
                            return finish_failed(ctx, task, reason, Some(review)).await;
                        }
                        ReviewDecision::Blocked(reason) => {
                            return finish_blocked(ctx, task, reason, None).await;
                        }
                    }
                }
            },
        }
    }

    if !ctx.config.merge_on_success {
        return finish_closed(ctx, task, None).await;
    }

    let remediator = ImplementRemediator { ctx, task, attempt };
    let outcome = landing::land_task(
        ctx.landing_lock,
        ctx.vcs,
        &remediator,
        ctx.sink,
        LandRequest { task_id, branch: &branch },
    )
    .await;

    match outcome {
        LandOutcome::Closed { commit_sha } => finish_closed(ctx, task, Some(commit_sha)).await,
        LandOutcome::Blocked { reason, commit_sha } => finish_blocked(ctx, task, reason, commit_sha).await,
    }
}

async fn run_branch_step(ctx: &LifecycleContext<'_>, task: &Task) -> AdapterResult<String> {
    ctx.vcs.ensure_main().await?;
    let branch = ctx.vcs.create_task_branch(&task.id).await?;
    ctx.vcs.checkout(&branch).await?;
    emit(
        ctx.sink,
        Event::new(EventType::BranchCreated, task.id.as_str(), Utc::now())
            .with_message(branch.clone()),
    )
    .await;
    Ok(branch)
}

async fn run_implement_step(
    ctx: &LifecycleContext<'_>,
    task: &Task,
    prior: &PriorFeedback,
    attempt: u32,
) -> AdapterResult<RunnerResult> {
    let prompt = build_implement_prompt(task, prior, attempt);
    emit(
        ctx.sink,
        Event::new(EventType::RunnerStarted, task.id.as_str(), Utc::now())
            .with_metadata_entry("mode", "implement")
            .with_clone_path(ctx.repo_root.display().to_string()),
    )
    .await;

    let request = RunnerRequest {
        task_id: task.id.clone(),
        parent_id: ctx.parent_id.clone(),
        prompt,
        mode: RunnerMode::Implement,
        model: ctx.config.model.clone(),
        repo_root: ctx.repo_root.clone(),
        timeout: ctx.config.runner_timeout,
        metadata: BTreeMap::new(),
        on_progress: None,
    };

    let result = run_runner_observed(ctx, task.id.as_str(), request).await;

    if let Ok(r) = &result {
        emit(
            ctx.sink,
            Event::new(EventType::RunnerFinished, task.id.as_str(), Utc::now())
                .with_metadata_entry("status", runner_status_str(r.status))
                .with_metadata_entry("reason", r.reason.clone().unwrap_or_default()),
        )
        .await;
    }

    result
}

/// Runs one runner request while concurrently emitting `runner_heartbeat`
/// on a fixed interval, forwarding the runner's [`RunnerProgress`]
/// callbacks into `runner_output`/`runner_cmd_started`/
/// `runner_cmd_finished` events, and raising one `runner_warning` if no
/// progress arrives within `stall_warning_threshold`. Purely
/// observational: the runner's own `timeout` still governs the hard
/// deadline and this wrapper changes no outcome, only the event stream.
async fn run_runner_observed(
    ctx: &LifecycleContext<'_>,
    task_id: &str,
    mut request: RunnerRequest,
) -> AdapterResult<RunnerResult> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<crate::adapters::RunnerProgress>();
    request.on_progress = Some(Box::new(move |progress| {
        let _ = tx.send(progress);
    }));

    let run_fut = ctx.runner.run(request);
    tokio::pin!(run_fut);

    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_interval.max(Duration::from_millis(1)));
    heartbeat.tick().await; // first tick fires immediately
    let started = tokio::time::Instant::now();
    let mut last_progress = started;
    let mut warned = false;

    loop {
        tokio::select! {
            result = &mut run_fut => return result,
            _ = heartbeat.tick() => {
                emit(ctx.sink, Event::new(EventType::RunnerHeartbeat, task_id, Utc::now())).await;
                let stalled_for = last_progress.elapsed();
                if !warned && stalled_for >= ctx.config.stall_warning_threshold {
                    warned = true;
                    emit(
                        ctx.sink,
                        Event::new(EventType::RunnerWarning, task_id, Utc::now())
                            .with_message(format!("no runner output for {stalled_for:?}"))
                            .with_metadata_entry("last_output_age", format!("{:?}", stalled_for)),
                    )
                    .await;
                }
            }
            Some(progress) = rx.recv() => {
                last_progress = tokio::time::Instant::now();
                match progress {
                    crate::adapters::RunnerProgress::Output(text) => {
                        emit(ctx.sink, Event::new(EventType::RunnerOutput, task_id, Utc::now()).with_message(text)).await;
                    }
                    crate::adapters::RunnerProgress::CommandStarted { command } => {
                        emit(ctx.sink, Event::new(EventType::RunnerCmdStarted, task_id, Utc::now()).with_message(command)).await;
                    }
                    crate::adapters::RunnerProgress::CommandFinished { command, exit_code } => {
                        let mut event = Event::new(EventType::RunnerCmdFinished, task_id, Utc::now()).with_message(command);
                        if let Some(code) = exit_code {
                            event = event.with_metadata_entry("exit_code", code.to_string());
                        }
                        emit(ctx.sink, event).await;
                    }
                    crate::adapters::RunnerProgress::Heartbeat => {
                        emit(ctx.sink, Event::new(EventType::RunnerHeartbeat, task_id, Utc::now())).await;
                    }
                }
            }
        }
    }
}

enum ReviewDecision {
    Land { verdict: Option<String>, feedback: Option<String> },
    Remediate(String),
    GenericRetry(String),
    Blocked(String),
}

async fn run_review(ctx: &LifecycleContext<'_>, task: &Task, review_retry_count: u32) -> ReviewDecision {
    let mut verdict_retry_used = false;

    loop {
        let review_attempt = if verdict_retry_used { 2 } else { 1 };
        emit(
            ctx.sink,
            Event::new(EventType::ReviewStarted, task.id.as_str(), Utc::now())
                .with_metadata_entry("review_attempt", review_attempt.to_string())
                .with_metadata_entry("review_retry_count", review_retry_count.to_string()),
        )
        .await;

        let request = RunnerRequest {
            task_id: task.id.clone(),
            parent_id: ctx.parent_id.clone(),
            prompt: build_review_prompt(task),
            mode: RunnerMode::Review,
            model: ctx.config.model.clone(),
            repo_root: ctx.repo_root.clone(),
            timeout: ctx.config.runner_timeout,
            metadata: BTreeMap::new(),
            on_progress: None,
        };

        let result = match run_runner_observed(ctx, task.id.as_str(), request).await {
            Ok(r) => r,
            Err(e) => {
                return ReviewDecision::GenericRetry(format!("review runner error: {e}"));
            }
        };

        emit(
            ctx.sink,
            Event::new(EventType::ReviewFinished, task.id.as_str(), Utc::now())
                .with_metadata_entry("status", runner_status_str(result.status))
                .with_metadata_entry("review_attempt", review_attempt.to_string()),
        )
        .await;

        match result.status {
            RunnerStatus::Completed => {
                if result.review_ready {
                    return ReviewDecision::Land {
                        verdict: result.artifacts.get("review_verdict").cloned(),
                        feedback: result.artifacts.get("review_fail_feedback").cloned(),
                    };
                }

                match result.artifacts.get("review_verdict").map(String::as_str) {
                    Some("fail") => {
                        let feedback = result.artifacts.get("review_fail_feedback").cloned().unwrap_or_default();
                        return ReviewDecision::Remediate(feedback);
                    }
                    None if !verdict_retry_used => {
                        verdict_retry_used = true;
                        continue;
                    }
                    _ => {
                        let feedback = result
                            .artifacts
                            .get("review_fail_feedback")
                            .cloned()
                            .unwrap_or_else(|| "review did not return a usable verdict".to_string());
                        return ReviewDecision::Remediate(feedback);
                    }
                }
            }
            RunnerStatus::Blocked => {
                return ReviewDecision::Blocked(
                    result.reason.unwrap_or_else(|| "review runner reported blocked".to_string()),
                );
            }
            RunnerStatus::Failed => {
                let reason = result.reason.unwrap_or_else(|| "review failed".to_string());
                return ReviewDecision::GenericRetry(format!("review rejected: {reason}"));
            }
        }
    }
}

/// Wraps the one bounded "Landing Merge Remediation" implement call that
/// [`landing::land_task`] invokes on a merge conflict.
struct ImplementRemediator<'a, 'b> {
    ctx: &'a LifecycleContext<'b>,
    task: &'a Task,
    attempt: u32,
}

#[async_trait]
impl MergeRemediator for ImplementRemediator<'_, '_> {
    async fn remediate(&self, merge_failure_details: &str) -> AdapterResult<RunnerResult> {
        let prior = PriorFeedback::LandingRemediation(merge_failure_details.to_string());
        run_implement_step(self.ctx, self.task, &prior, self.attempt).await
    }
}

fn runner_status_str(status: RunnerStatus) -> &'static str {
    match status {
        RunnerStatus::Completed => "completed",
        RunnerStatus::Blocked => "blocked",
        RunnerStatus::Failed => "failed",
    }
}

async fn finish_closed(
    ctx: &LifecycleContext<'_>,
    task: &Task,
    commit_sha: Option<String>,
) -> Result<LifecycleOutcome, LifecycleError> {
    ctx.tracker.set_task_status(&task.id, TaskStatus::Closed).await?;
    if let Some(sha) = commit_sha {
        ctx.tracker
            .set_task_data(&task.id, BTreeMap::from([("auto_commit_sha".to_string(), sha)]))
            .await?;
    }
    emit(
        ctx.sink,
        Event::new(EventType::TaskFinished, task.id.as_str(), Utc::now()).with_message("closed"),
    )
    .await;
    Ok(LifecycleOutcome::Closed)
}

async fn finish_blocked(
    ctx: &LifecycleContext<'_>,
    task: &Task,
    reason: String,
    commit_sha: Option<String>,
) -> Result<LifecycleOutcome, LifecycleError> {
    let mut triage = BTreeMap::from([
        ("triage_status".to_string(), "blocked".to_string()),
        ("triage_reason".to_string(), reason.clone()),
    ]);
    if let Some(sha) = commit_sha {
        triage.insert("auto_commit_sha".to_string(), sha);
    }
    ctx.tracker.set_task_data(&task.id, triage.clone()).await?;
    ctx.tracker.set_task_status(&task.id, TaskStatus::Blocked).await?;
    emit(
        ctx.sink,
        Event::new(EventType::TaskFinished, task.id.as_str(), Utc::now())
            .with_message("blocked")
            .with_metadata(triage),
    )
    .await;
    Ok(LifecycleOutcome::Blocked { reason })
}

/// Review-originated fields attached to a terminal `failed` outcome,
/// per spec.md §4.4's "plus -- when review-related" triage clause.
/// Left as `None` when the failure never went through a review call.
struct ReviewTriage {
    verdict: Option<String>,
    feedback: Option<String>,
    retry_count: Option<u32>,
}

async fn finish_failed(
    ctx: &LifecycleContext<'_>,
    task: &Task,
    reason: String,
    review: Option<ReviewTriage>,
) -> Result<LifecycleOutcome, LifecycleError> {
    let mut triage = BTreeMap::from([
        ("triage_status".to_string(), "failed".to_string()),
        ("triage_reason".to_string(), reason.clone()),
    ]);
    if let Some(review) = review {
        if let Some(verdict) = review.verdict {
            triage.insert("review_verdict".to_string(), verdict);
        }
        if let Some(feedback) = review.feedback {
            triage.insert("review_fail_feedback".to_string(), feedback);
        }
        if let Some(retry_count) = review.retry_count {
            triage.insert("review_retry_count".to_string(), retry_count.to_string());
        }
    }
    ctx.tracker.set_task_data(&task.id, triage.clone()).await?;
    ctx.tracker.set_task_status(&task.id, TaskStatus::Failed).await?;
    emit(
        ctx.sink,
        Event::new(EventType::TaskFinished, task.id.as_str(), Utc::now())
            .with_message("failed")
            .with_metadata(triage),
    )
    .await;
    Ok(LifecycleOutcome::Failed { reason })
}

async fn emit(sink: &dyn EventSink, event: Event) {
    if let Err(e) = sink.emit(event).await {
        tracing::warn!(error = %e, "failed to emit lifecycle event (best-effort)");
    }
}

fn _assert_object_safety(_: &dyn Vcs, _: &dyn AgentRunner, _: &dyn TaskManager, _: &dyn EventSink) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterError, MergeOutcome};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct FixedVcs;
    #[async_trait]
    impl Vcs for FixedVcs {
        async fn ensure_main(&self) -> AdapterResult<()> {
            Ok(())
        }
        async fn create_task_branch(&self, task_id: &str) -> AdapterResult<String> {
            Ok(format!("task/{task_id}"))
        }
        async fn checkout(&self, _reference: &str) -> AdapterResult<()> {
            Ok(())
        }
        async fn commit_all(&self, _message: &str) -> AdapterResult<String> {
            Ok("sha-1".to_string())
        }
        async fn merge_to_main(&self, _branch: &str) -> AdapterResult<MergeOutcome> {
            Ok(MergeOutcome::Success)
        }
        async fn push_branch(&self, _branch: &str) -> AdapterResult<()> {
            Ok(())
        }
        async fn push_main(&self) -> AdapterResult<()> {
            Ok(())
        }
    }

    struct ScriptedRunner {
        results: StdMutex<VecDeque<RunnerResult>>,
        requests: StdMutex<Vec<RunnerRequest>>,
    }

    fn completed(review_ready: bool, artifacts: BTreeMap<String, String>) -> RunnerResult {
        RunnerResult {
            status: RunnerStatus::Completed,
            reason: None,
            log_path: None,
            artifacts,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            review_ready,
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn run(&self, request: RunnerRequest) -> AdapterResult<RunnerResult> {
            self.requests.lock().unwrap().push(request);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AdapterError::Runner("scripted runner exhausted".to_string()))
        }
    }

    struct InMemoryTracker {
        tasks: StdMutex<BTreeMap<String, Task>>,
    }

    #[async_trait]
    impl TaskManager for InMemoryTracker {
        async fn next_tasks(&self, _parent: &str) -> AdapterResult<Vec<crate::graph::TaskSummary>> {
            Ok(vec![])
        }
        async fn get_task(&self, id: &str) -> AdapterResult<Task> {
            self.tasks
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| AdapterError::Tracker(format!("no such task {id}")))
        }
        async fn set_task_status(&self, id: &str, status: TaskStatus) -> AdapterResult<()> {
            if let Some(t) = self.tasks.lock().unwrap().get_mut(id) {
                t.status = status;
            }
            Ok(())
        }
        async fn set_task_data(&self, id: &str, data: BTreeMap<String, String>) -> AdapterResult<()> {
            if let Some(t) = self.tasks.lock().unwrap().get_mut(id) {
                t.metadata.extend(data);
            }
            Ok(())
        }
        async fn get_task_tree(
            &self,
            _parent: &str,
        ) -> AdapterResult<(Vec<Task>, Vec<crate::task::TaskRelation>)> {
            Ok((vec![], vec![]))
        }
    }

    struct NoopSink;
    #[async_trait]
    impl EventSink for NoopSink {
        async fn emit(&self, _event: Event) -> AdapterResult<()> {
            Ok(())
        }
    }

    fn sample_task() -> Task {
        Task {
            id: "t-1".to_string(),
            title: "Add retries".to_string(),
            description: "desc".to_string(),
            status: TaskStatus::Open,
            parent: None,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn happy_path_closes_and_lands() {
        let task = sample_task();
        let tracker = InMemoryTracker { tasks: StdMutex::new(BTreeMap::from([(task.id.clone(), task.clone())])) };
        let runner = ScriptedRunner {
            results: StdMutex::new(VecDeque::from(vec![
                completed(false, BTreeMap::new()),
                completed(true, BTreeMap::new()),
            ])),
            requests: StdMutex::new(Vec::new()),
        };
        let vcs = FixedVcs;
        let landing_lock = LandingLock::new();
        let config = LifecycleConfig {
            require_review: true,
            merge_on_success: true,
            max_retries: 2,
            runner_timeout: Duration::from_secs(60),
            model: None,
            heartbeat_interval: Duration::from_secs(3600),
            stall_warning_threshold: Duration::from_secs(3600),
        };
        let ctx = LifecycleContext {
            tracker: &tracker,
            runner: &runner,
            vcs: &vcs,
            sink: &NoopSink,
            landing_lock: &landing_lock,
            repo_root: PathBuf::from("/tmp/clone-t-1"),
            parent_id: "root".to_string(),
            config: &config,
        };

        let outcome = run_task_lifecycle(&ctx, &task).await.unwrap();
        assert!(matches!(outcome, LifecycleOutcome::Closed));
        assert_eq!(tracker.tasks.lock().unwrap()[&task.id].status, TaskStatus::Closed);
        assert_eq!(runner.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn review_remediation_retry_includes_prior_feedback() {
        let task = sample_task();
        let tracker = InMemoryTracker { tasks: StdMutex::new(BTreeMap::from([(task.id.clone(), task.clone())])) };
        let runner = ScriptedRunner {
            results: StdMutex::new(VecDeque::from(vec![
                completed(false, BTreeMap::new()),
                completed(
                    false,
                    BTreeMap::from([
                        ("review_verdict".to_string(), "fail".to_string()),
                        ("review_fail_feedback".to_string(), "missing regression test".to_string()),
                    ]),
                ),
                completed(false, BTreeMap::new()),
                completed(true, BTreeMap::new()),
            ])),
            requests: StdMutex::new(Vec::new()),
        };
        let vcs = FixedVcs;
        let landing_lock = LandingLock::new();
        let config = LifecycleConfig {
            require_review: true,
            merge_on_success: true,
            max_retries: 2,
            runner_timeout: Duration::from_secs(60),
            model: None,
            heartbeat_interval: Duration::from_secs(3600),
            stall_warning_threshold: Duration::from_secs(3600),
        };
        let ctx = LifecycleContext {
            tracker: &tracker,
            runner: &runner,
            vcs: &vcs,
            sink: &NoopSink,
            landing_lock: &landing_lock,
            repo_root: PathBuf::from("/tmp/clone-t-1"),
            parent_id: "root".to_string(),
            config: &config,
        };

        let outcome = run_task_lifecycle(&ctx, &task).await.unwrap();
        assert!(matches!(outcome, LifecycleOutcome::Closed));
        let requests = runner.requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        assert!(requests[2].prompt.contains("Prior Review Blockers:"));
        assert!(requests[2].prompt.contains("missing regression test"));
    }

    #[tokio::test]
    async fn review_retry_exhausted_fails_with_triage_reason() {
        let task = sample_task();
        let tracker = InMemoryTracker { tasks: StdMutex::new(BTreeMap::from([(task.id.clone(), task.clone())])) };
        let runner = ScriptedRunner {
            results: StdMutex::new(VecDeque::from(vec![
                completed(false, BTreeMap::new()),
                completed(
                    false,
                    BTreeMap::from([
                        ("review_verdict".to_string(), "fail".to_string()),
                        ("review_fail_feedback".to_string(), "feedback one".to_string()),
                    ]),
                ),
                completed(false, BTreeMap::new()),
                completed(
                    false,
                    BTreeMap::from([
                        ("review_verdict".to_string(), "fail".to_string()),
                        ("review_fail_feedback".to_string(), "feedback two".to_string()),
                    ]),
                ),
            ])),
            requests: StdMutex::new(Vec::new()),
        };
        let vcs = FixedVcs;
        let landing_lock = LandingLock::new();
        let config = LifecycleConfig {
            require_review: true,
            merge_on_success: true,
            max_retries: 1,
            runner_timeout: Duration::from_secs(60),
            model: None,
            heartbeat_interval: Duration::from_secs(3600),
            stall_warning_threshold: Duration::from_secs(3600),
        };
        let ctx = LifecycleContext {
            tracker: &tracker,
            runner: &runner,
            vcs: &vcs,
            sink: &NoopSink,
            landing_lock: &landing_lock,
            repo_root: PathBuf::from("/tmp/clone-t-1"),
            parent_id: "root".to_string(),
            config: &config,
        };

        let outcome = run_task_lifecycle(&ctx, &task).await.unwrap();
        match outcome {
            LifecycleOutcome::Failed { reason } => assert!(reason.contains("feedback two")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(tracker.tasks.lock().unwrap()[&task.id].status, TaskStatus::Failed);
        assert_eq!(
            tracker.tasks.lock().unwrap()[&task.id].metadata.get("triage_status").unwrap(),
            "failed"
        );
    }

    #[tokio::test]
    async fn runner_blocked_status_blocks_task_without_landing() {
        let task = sample_task();
        let tracker = InMemoryTracker { tasks: StdMutex::new(BTreeMap::from([(task.id.clone(), task.clone())])) };
        let runner = ScriptedRunner {
            results: StdMutex::new(VecDeque::from(vec![RunnerResult {
                status: RunnerStatus::Blocked,
                reason: Some("runner timeout after 300s".to_string()),
                log_path: None,
                artifacts: BTreeMap::new(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
                review_ready: false,
            }])),
            requests: StdMutex::new(Vec::new()),
        };
        let vcs = FixedVcs;
        let landing_lock = LandingLock::new();
        let config = LifecycleConfig {
            require_review: false,
            merge_on_success: true,
            max_retries: 2,
            runner_timeout: Duration::from_secs(60),
            model: None,
            heartbeat_interval: Duration::from_secs(3600),
            stall_warning_threshold: Duration::from_secs(3600),
        };
        let ctx = LifecycleContext {
            tracker: &tracker,
            runner: &runner,
            vcs: &vcs,
            sink: &NoopSink,
            landing_lock: &landing_lock,
            repo_root: PathBuf::from("/tmp/clone-t-1"),
            parent_id: "root".to_string(),
            config: &config,
        };

        let outcome = run_task_lifecycle(&ctx, &task).await.unwrap();
        match outcome {
            LifecycleOutcome::Blocked { reason } => assert!(reason.contains("timeout")),
            other => panic!("expected Blocked, got {other:?}"),
        }
        assert_eq!(tracker.tasks.lock().unwrap()[&task.id].status, TaskStatus::Blocked);
    }
}
