//! End-to-end scenarios driving the real lifecycle/landing/graph/worker
//! code against `drover-test-utils`'s fakes. Nothing about these tests
//! doubles the lifecycle state machine itself -- only the tracker, the
//! agent runner, and the VCS are faked.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use drover_core::adapters::{AdapterResult, MergeOutcome, RunnerResult, RunnerStatus, TaskManager};
use drover_core::graph::TaskGraph;
use drover_core::landing;
use drover_core::lifecycle::{run_task_lifecycle, LifecycleConfig, LifecycleContext, LifecycleOutcome};
use drover_core::lock::LandingLock;
use drover_core::state_store::{self, StateStore};
use drover_core::task::{EdgeKind, Task, TaskRelation, TaskStatus};
use drover_core::worker::{run_worker_pool, WorkerPoolConfig, WorkerPoolDeps, WorkerPoolOutcome};
use drover_test_utils::{
    FakeAgentRunner, FakeTaskManager, RecordingCloneManager, RecordingEventSink, RecordingVcs, RecordingVcsFactory,
};
use tokio_util::sync::CancellationToken;

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

fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: format!("task {id}"),
        description: String::new(),
        status: TaskStatus::Open,
        parent: None,
        metadata: BTreeMap::new(),
    }
}

fn default_lifecycle_config() -> LifecycleConfig {
    LifecycleConfig {
        require_review: true,
        merge_on_success: true,
        max_retries: 2,
        runner_timeout: Duration::from_secs(60),
        model: None,
        heartbeat_interval: Duration::from_secs(3600),
        stall_warning_threshold: Duration::from_secs(3600),
    }
}

// S1: single task, no deps, clean implement + review + land.
#[tokio::test]
async fn s1_single_task_happy_path_lands_cleanly() {
    let t = task("t-1");
    let runner = FakeAgentRunner::new(vec![completed(false, BTreeMap::new()), completed(true, BTreeMap::new())]);
    let vcs = RecordingVcs::new();
    let sink = RecordingEventSink::new();
    let landing_lock = LandingLock::new();
    let config = default_lifecycle_config();

    let ctx = LifecycleContext {
        tracker: &FakeTaskManager::new(vec![t.clone()], vec![]),
        runner: &runner,
        vcs: &vcs,
        sink: &sink,
        landing_lock: &landing_lock,
        repo_root: PathBuf::from("/tmp/clone-t-1"),
        parent_id: "root".to_string(),
        config: &config,
    };

    let outcome = run_task_lifecycle(&ctx, &t).await.unwrap();
    assert!(matches!(outcome, LifecycleOutcome::Closed));

    assert_eq!(
        vcs.call_log(),
        vec!["ensure_main", "create_task_branch", "checkout", "commit_all", "merge_to_main", "push_main"],
    );
    assert_eq!(runner.request_count(), 2);
}

// S2: review remediation loop succeeds on the second pass.
#[tokio::test]
async fn s2_review_retry_succeeds_with_prior_feedback_in_prompt() {
    let t = task("t-1");
    let runner = FakeAgentRunner::new(vec![
        completed(false, BTreeMap::new()),
        completed(
            false,
            BTreeMap::from([
                ("review_verdict".to_string(), "fail".to_string()),
                ("review_fail_feedback".to_string(), "missing regression test for retry/backoff flow".to_string()),
            ]),
        ),
        completed(false, BTreeMap::new()),
        completed(true, BTreeMap::new()),
    ]);
    let vcs = RecordingVcs::new();
    let sink = RecordingEventSink::new();
    let landing_lock = LandingLock::new();
    let config = LifecycleConfig { max_retries: 2, ..default_lifecycle_config() };

    let ctx = LifecycleContext {
        tracker: &FakeTaskManager::new(vec![t.clone()], vec![]),
        runner: &runner,
        vcs: &vcs,
        sink: &sink,
        landing_lock: &landing_lock,
        repo_root: PathBuf::from("/tmp/clone-t-1"),
        parent_id: "root".to_string(),
        config: &config,
    };

    let outcome = run_task_lifecycle(&ctx, &t).await.unwrap();
    assert!(matches!(outcome, LifecycleOutcome::Closed));

    let requests = runner.requests();
    assert_eq!(requests.len(), 4);
    assert!(requests[2].prompt.contains("Prior Review Blockers:"));
    assert!(requests[2].prompt.contains("missing regression test for retry/backoff flow"));
}

// S3: review remediation exhausts the retry budget and the task fails.
#[tokio::test]
async fn s3_review_retry_exhausted_fails_with_final_feedback() {
    let t = task("t-1");
    let runner = FakeAgentRunner::new(vec![
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
    ]);
    let vcs = RecordingVcs::new();
    let sink = RecordingEventSink::new();
    let landing_lock = LandingLock::new();
    let config = LifecycleConfig { max_retries: 1, ..default_lifecycle_config() };
    let tracker = FakeTaskManager::new(vec![t.clone()], vec![]);

    let ctx = LifecycleContext {
        tracker: &tracker,
        runner: &runner,
        vcs: &vcs,
        sink: &sink,
        landing_lock: &landing_lock,
        repo_root: PathBuf::from("/tmp/clone-t-1"),
        parent_id: "root".to_string(),
        config: &config,
    };

    let outcome = run_task_lifecycle(&ctx, &t).await.unwrap();
    match outcome {
        LifecycleOutcome::Failed { reason } => assert!(reason.contains("feedback two")),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(runner.request_count(), 4);
    assert!(vcs.call_log().iter().all(|c| c != "merge_to_main" && c != "push_main"));

    let snapshot = tracker.snapshot().await;
    let final_task = &snapshot["t-1"];
    assert_eq!(final_task.status, TaskStatus::Failed);
    assert_eq!(final_task.metadata.get("triage_reason").unwrap(), "review rejected: feedback two");
    assert_eq!(final_task.metadata.get("triage_status").unwrap(), "failed");
    assert_eq!(final_task.metadata.get("review_verdict").unwrap(), "fail");
    assert_eq!(final_task.metadata.get("review_fail_feedback").unwrap(), "feedback two");
    assert_eq!(final_task.metadata.get("review_retry_count").unwrap(), "1");
}

// An implement-mode `RunnerStatus::Failed` is terminal immediately: no
// blind retry of an unclassified implement failure, even with retry
// budget remaining (spec.md §7: "others in implement mode are terminal
// for that task in this release").
#[tokio::test]
async fn implement_failure_is_terminal_without_retry() {
    let t = task("t-1");
    let runner = FakeAgentRunner::new(vec![RunnerResult {
        status: RunnerStatus::Failed,
        reason: Some("agent crashed".to_string()),
        log_path: None,
        artifacts: BTreeMap::new(),
        started_at: Utc::now(),
        finished_at: Utc::now(),
        review_ready: false,
    }]);
    let vcs = RecordingVcs::new();
    let sink = RecordingEventSink::new();
    let landing_lock = LandingLock::new();
    let config = LifecycleConfig { max_retries: 3, ..default_lifecycle_config() };
    let tracker = FakeTaskManager::new(vec![t.clone()], vec![]);

    let ctx = LifecycleContext {
        tracker: &tracker,
        runner: &runner,
        vcs: &vcs,
        sink: &sink,
        landing_lock: &landing_lock,
        repo_root: PathBuf::from("/tmp/clone-t-1"),
        parent_id: "root".to_string(),
        config: &config,
    };

    let outcome = run_task_lifecycle(&ctx, &t).await.unwrap();
    match outcome {
        LifecycleOutcome::Failed { reason } => assert!(reason.contains("agent crashed")),
        other => panic!("expected Failed, got {other:?}"),
    }
    // Exactly one implement call -- no retry was attempted.
    assert_eq!(runner.request_count(), 1);

    let snapshot = tracker.snapshot().await;
    let final_task = &snapshot["t-1"];
    assert_eq!(final_task.status, TaskStatus::Failed);
    assert_eq!(final_task.metadata.get("triage_status").unwrap(), "failed");
    // Not review-related: no review_* triage fields are written.
    assert!(!final_task.metadata.contains_key("review_verdict"));
    assert!(!final_task.metadata.contains_key("review_fail_feedback"));
    assert!(!final_task.metadata.contains_key("review_retry_count"));
}

// S4: a merge conflict is remediated by one extra implement run, then lands.
#[tokio::test]
async fn s4_landing_merge_conflict_remediated() {
    let branch = "drover/t-1";
    let vcs = RecordingVcs::new();
    vcs.script_merge(Ok(MergeOutcome::Conflict { details: "CONFLICT (content): src/lib.rs".to_string() }));
    vcs.script_merge(Ok(MergeOutcome::Success));
    let sink = RecordingEventSink::new();
    let landing_lock = LandingLock::new();

    struct OneShotRemediator(FakeAgentRunner);
    #[async_trait::async_trait]
    impl landing::MergeRemediator for OneShotRemediator {
        async fn remediate(&self, merge_failure_details: &str) -> AdapterResult<RunnerResult> {
            assert!(merge_failure_details.contains("CONFLICT"));
            self.0
                .run(drover_core::adapters::RunnerRequest {
                    task_id: "t-1".to_string(),
                    parent_id: "root".to_string(),
                    prompt: format!("Landing Merge Remediation:\nMerge Failure Details:\n{merge_failure_details}"),
                    mode: drover_core::adapters::RunnerMode::Implement,
                    model: None,
                    repo_root: PathBuf::from("/tmp/clone-t-1"),
                    timeout: Duration::from_secs(60),
                    metadata: BTreeMap::new(),
                    on_progress: None,
                })
                .await
        }
    }
    let remediator = OneShotRemediator(FakeAgentRunner::new(vec![completed(true, BTreeMap::new())]));

    let outcome = landing::land_task(
        &landing_lock,
        &vcs,
        &remediator,
        &sink,
        landing::LandRequest { task_id: "t-1", branch },
    )
    .await;

    assert!(matches!(outcome, landing::LandOutcome::Closed { .. }));
    let calls = vcs.call_log();
    assert_eq!(calls.iter().filter(|c| *c == "merge_to_main").count(), 2);

    let remediation_requests = remediator.0.requests();
    assert_eq!(remediation_requests.len(), 1);
    assert!(remediation_requests[0].prompt.contains("Landing Merge Remediation:"));
    assert!(remediation_requests[0].prompt.contains("Merge Failure Details:"));

    let event_kinds: Vec<_> = sink.events().into_iter().map(|e| e.kind).collect();
    assert!(event_kinds.contains(&drover_core::events::EventType::MergeRetry));
    assert!(event_kinds.contains(&drover_core::events::EventType::MergeLanded));
}

// S5: merge conflict whose remediation itself does not complete; no
// second merge attempt is made and the task ends up blocked, not failed.
#[tokio::test]
async fn s5_landing_merge_conflict_unremediable_blocks_without_second_merge() {
    let branch = "drover/t-1";
    let vcs = RecordingVcs::new();
    vcs.script_merge(Ok(MergeOutcome::Conflict { details: "CONFLICT (content): src/lib.rs".to_string() }));
    let sink = RecordingEventSink::new();
    let landing_lock = LandingLock::new();

    struct FailingRemediator;
    #[async_trait::async_trait]
    impl landing::MergeRemediator for FailingRemediator {
        async fn remediate(&self, _merge_failure_details: &str) -> AdapterResult<RunnerResult> {
            Ok(RunnerResult {
                status: RunnerStatus::Failed,
                reason: Some("could not resolve the conflict".to_string()),
                log_path: None,
                artifacts: BTreeMap::new(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
                review_ready: false,
            })
        }
    }

    let outcome = landing::land_task(
        &landing_lock,
        &vcs,
        &FailingRemediator,
        &sink,
        landing::LandRequest { task_id: "t-1", branch },
    )
    .await;

    match outcome {
        landing::LandOutcome::Blocked { reason, commit_sha } => {
            assert!(reason.contains("merge-conflict remediation"));
            assert!(commit_sha.is_some());
        }
        other => panic!("expected Blocked, got {other:?}"),
    }

    let calls = vcs.call_log();
    assert_eq!(calls.iter().filter(|c| *c == "merge_to_main").count(), 1);

    let event_kinds: Vec<_> = sink.events().into_iter().map(|e| e.kind).collect();
    assert!(event_kinds.contains(&drover_core::events::EventType::MergeBlocked));
    assert!(!event_kinds.contains(&drover_core::events::EventType::MergeLanded));
}

// S6: a three-task graph where t-3 depends on t-1 and t-2. The first
// run fails partway through (simulated by a tracker whose writes for
// t-1 error out once) and a second run, seeded from the same state
// file, resumes without redoing t-1.
#[tokio::test]
async fn s6_resume_after_interruption_does_not_redo_completed_work() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let tasks = vec![task("t-1"), task("t-2"), task("t-3")];
    let relations = vec![
        TaskRelation { kind: EdgeKind::DependsOn, from: "t-3".to_string(), to: "t-1".to_string() },
        TaskRelation { kind: EdgeKind::DependsOn, from: "t-3".to_string(), to: "t-2".to_string() },
    ];

    // First run: t-1 and t-2 complete, t-3 becomes schedulable only
    // after both finish. We drive this run directly against a
    // `FakeTaskManager` / `StateStore` pair, then simulate an
    // interruption right after t-1's lifecycle reported Closed by
    // writing the state file's `completed` set by hand (standing in
    // for `apply_result` having recorded it) and dropping everything
    // else, without ever marking t-1 closed in the tracker itself --
    // exactly the "agent completed, tracker write pending" gap
    // recovery exists to close.
    let state_store = StateStore::new(&state_path);
    {
        let mut loaded = state_store.load("root").await.unwrap();
        loaded.snapshot.completed.insert("t-1".to_string());
        state_store.save(&loaded).await.unwrap();
    }

    let tracker = FakeTaskManager::new(tasks, relations);
    state_store::recover(&state_store, "root", &tracker).await.unwrap();

    // Recovery replays the completed set into the tracker even though
    // this process never ran t-1's lifecycle.
    assert_eq!(tracker.snapshot().await["t-1"].status, TaskStatus::Closed);

    let mut graph = {
        let (all_tasks, all_relations) = tracker.get_task_tree("root").await.unwrap();
        TaskGraph::build("root", all_tasks, all_relations).unwrap()
    };

    let runner = Arc::new(FakeAgentRunner::new(vec![
        // t-2: implement + review.
        completed(false, BTreeMap::new()),
        completed(true, BTreeMap::new()),
        // t-3: implement + review, once t-1 and t-2 are both closed.
        completed(false, BTreeMap::new()),
        completed(true, BTreeMap::new()),
    ]));
    let runner_for_assertion = runner.clone();

    let deps = WorkerPoolDeps {
        tracker: Arc::new(tracker),
        runner,
        vcs_factory: Arc::new(RecordingVcsFactory),
        clones: Arc::new(RecordingCloneManager::new()),
        sink: Arc::new(RecordingEventSink::new()),
        landing_lock: LandingLock::new(),
        state_store: state_store.clone(),
        repo_root: dir.path().to_path_buf(),
    };

    let pool_config = WorkerPoolConfig {
        parent_id: "root".to_string(),
        max_workers: 2,
        cpu_count: 2,
        max_tasks: None,
        lifecycle: default_lifecycle_config(),
    };

    let cancel = CancellationToken::new();
    let outcome = run_worker_pool(&mut graph, &deps, &pool_config, &cancel).await;

    assert!(matches!(outcome, WorkerPoolOutcome::Completed));
    assert_eq!(graph.node("t-1").unwrap().task.status, TaskStatus::Closed);
    assert_eq!(graph.node("t-2").unwrap().task.status, TaskStatus::Closed);
    assert_eq!(graph.node("t-3").unwrap().task.status, TaskStatus::Closed);

    // t-1 never ran through the agent in this process: only t-2 and
    // t-3 together account for all four scripted runner results.
    assert_eq!(runner_for_assertion.request_count(), 4);
}

// max_tasks caps how many task attempts may reach a terminal state: with
// two independent, immediately-schedulable tasks and max_tasks=1, exactly
// one completes and the pool stops without touching the other.
#[tokio::test]
async fn max_tasks_stops_spawning_once_the_cap_is_hit() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let tasks = vec![task("t-1"), task("t-2")];
    let tracker = FakeTaskManager::new(tasks, vec![]);

    let mut graph = {
        let (all_tasks, all_relations) = tracker.get_task_tree("root").await.unwrap();
        TaskGraph::build("root", all_tasks, all_relations).unwrap()
    };

    let runner = Arc::new(FakeAgentRunner::new(vec![
        completed(false, BTreeMap::new()),
        completed(true, BTreeMap::new()),
    ]));

    let deps = WorkerPoolDeps {
        tracker: Arc::new(tracker),
        runner,
        vcs_factory: Arc::new(RecordingVcsFactory),
        clones: Arc::new(RecordingCloneManager::new()),
        sink: Arc::new(RecordingEventSink::new()),
        landing_lock: LandingLock::new(),
        state_store: StateStore::new(&state_path),
        repo_root: dir.path().to_path_buf(),
    };

    let pool_config = WorkerPoolConfig {
        parent_id: "root".to_string(),
        max_workers: 1,
        cpu_count: 1,
        max_tasks: Some(1),
        lifecycle: default_lifecycle_config(),
    };

    let cancel = CancellationToken::new();
    let outcome = run_worker_pool(&mut graph, &deps, &pool_config, &cancel).await;

    let remaining = match outcome {
        WorkerPoolOutcome::TaskLimitReached { remaining } => remaining,
        other => panic!("expected TaskLimitReached, got {other:?}"),
    };
    assert_eq!(remaining.len(), 1);

    let closed = graph.nodes().filter(|n| n.task.status == TaskStatus::Closed).count();
    let open = graph.nodes().filter(|n| n.task.status == TaskStatus::Open).count();
    assert_eq!(closed, 1);
    assert_eq!(open, 1);
}

// When the ready set is empty and the tracker's optional `IsComplete`
// oracle reports `false`, the pool surfaces `IncompleteGraph` instead of
// a plain `Stalled` exit -- the adapter knows of work this graph
// snapshot doesn't reflect.
#[tokio::test]
async fn incomplete_graph_oracle_overrides_stalled_when_adapter_says_not_done() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let t = task("t-1");
    let tracker = FakeTaskManager::new(vec![t], vec![]).with_is_complete(Some(false));

    let mut graph = {
        let (all_tasks, all_relations) = tracker.get_task_tree("root").await.unwrap();
        TaskGraph::build("root", all_tasks, all_relations).unwrap()
    };

    let runner = Arc::new(FakeAgentRunner::new(vec![RunnerResult {
        status: RunnerStatus::Blocked,
        reason: Some("runner timeout after 300s".to_string()),
        log_path: None,
        artifacts: BTreeMap::new(),
        started_at: Utc::now(),
        finished_at: Utc::now(),
        review_ready: false,
    }]));

    let deps = WorkerPoolDeps {
        tracker: Arc::new(tracker),
        runner,
        vcs_factory: Arc::new(RecordingVcsFactory),
        clones: Arc::new(RecordingCloneManager::new()),
        sink: Arc::new(RecordingEventSink::new()),
        landing_lock: LandingLock::new(),
        state_store: StateStore::new(&state_path),
        repo_root: dir.path().to_path_buf(),
    };

    let pool_config = WorkerPoolConfig {
        parent_id: "root".to_string(),
        max_workers: 1,
        cpu_count: 1,
        max_tasks: None,
        lifecycle: default_lifecycle_config(),
    };

    let cancel = CancellationToken::new();
    let outcome = run_worker_pool(&mut graph, &deps, &pool_config, &cancel).await;

    match outcome {
        WorkerPoolOutcome::IncompleteGraph { stuck_tasks } => assert_eq!(stuck_tasks, vec!["t-1".to_string()]),
        other => panic!("expected IncompleteGraph, got {other:?}"),
    }
}
