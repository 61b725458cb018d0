//! Landing queue: serializes merge-to-main attempts behind the
//! process-wide landing lock, with at most one merge-conflict
//! remediation cycle per task.
//!
//! The landing lock is acquired before auto-commit and released only
//! after the terminal landing decision, so `max_in_flight_merges <= 1`
//! holds for the whole run.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::adapters::{AdapterResult, EventSink, MergeOutcome, RunnerResult, RunnerStatus, Vcs};
use crate::errors::classify;
use crate::events::{Event, EventType};
use crate::lock::LandingLock;

/// One bounded remediation attempt: an additional implement run whose
/// prompt carries the merge failure details, invoked only after a
/// merge conflict on the first attempt.
#[async_trait]
pub trait MergeRemediator: Send + Sync {
    async fn remediate(&self, merge_failure_details: &str) -> AdapterResult<RunnerResult>;
}

/// Outcome of one landing attempt for a task.
#[derive(Debug, Clone)]
pub enum LandOutcome {
    Closed { commit_sha: String },
    Blocked { reason: String, commit_sha: Option<String> },
}

pub struct LandRequest<'a> {
    pub task_id: &'a str,
    pub branch: &'a str,
}

/// Run the full landing sequence for one task.
///
/// Sequence: emit `merge_queued` → acquire landing lock → auto-commit →
/// merge → (on conflict: `merge_retry`, one remediation implement run,
/// one more merge attempt) → `merge_landed`/`merge_blocked` →
/// `push_completed` on the success path.
pub async fn land_task(
    landing_lock: &Arc<LandingLock>,
    vcs: &dyn Vcs,
    remediator: &dyn MergeRemediator,
    sink: &dyn EventSink,
    req: LandRequest<'_>,
) -> LandOutcome {
    emit(
        sink,
        Event::new(EventType::MergeQueued, req.task_id, Utc::now())
            .with_metadata_entry("landing_status", "queued"),
    )
    .await;

    let _guard = landing_lock.lock().await;

    let commit_message = format!("chore(task): auto-commit before landing {}", req.task_id);
    let commit_sha = match vcs.commit_all(&commit_message).await {
        Ok(sha) => sha,
        Err(e) => {
            let reason = format!("commit error: {}", classify(&e.to_string()).cause);
            return blocked(sink, req.task_id, reason, None).await;
        }
    };

    match vcs.merge_to_main(req.branch).await {
        Ok(MergeOutcome::Success) => finish_landed(sink, vcs, req.task_id, commit_sha).await,
        Ok(MergeOutcome::Conflict { details }) => {
            emit(
                sink,
                Event::new(EventType::MergeRetry, req.task_id, Utc::now())
                    .with_metadata_entry("landing_status", "retrying")
                    .with_metadata_entry("auto_commit_sha", commit_sha.clone()),
            )
            .await;

            match remediator.remediate(&details).await {
                Ok(result) if result.status == RunnerStatus::Completed => {
                    match vcs.merge_to_main(req.branch).await {
                        Ok(MergeOutcome::Success) => {
                            finish_landed(sink, vcs, req.task_id, commit_sha).await
                        }
                        Ok(MergeOutcome::Conflict { details: second }) => {
                            let reason = format!(
                                "merge-conflict remediation retry still conflicted: {second}"
                            );
                            blocked(sink, req.task_id, reason, Some(commit_sha)).await
                        }
                        Err(e) => {
                            let reason = classify(&e.to_string()).cause;
                            blocked(sink, req.task_id, reason, Some(commit_sha)).await
                        }
                    }
                }
                // Per the merge-conflict remediation policy: if the
                // remediation implement run itself does not complete,
                // there is nothing new for a second merge to operate
                // on, so no second attempt is made.
                Ok(_) | Err(_) => {
                    let reason =
                        "merge-conflict remediation implement run did not complete".to_string();
                    blocked(sink, req.task_id, reason, Some(commit_sha)).await
                }
            }
        }
        Err(e) => {
            let reason = classify(&e.to_string()).cause;
            blocked(sink, req.task_id, reason, Some(commit_sha)).await
        }
    }
}

async fn finish_landed(sink: &dyn EventSink, vcs: &dyn Vcs, task_id: &str, commit_sha: String) -> LandOutcome {
    emit(
        sink,
        Event::new(EventType::MergeCompleted, task_id, Utc::now())
            .with_metadata_entry("auto_commit_sha", commit_sha.clone()),
    )
    .await;

    if let Err(e) = vcs.push_main().await {
        let reason = format!("push error: {}", classify(&e.to_string()).cause);
        return blocked(sink, task_id, reason, Some(commit_sha)).await;
    }

    emit(
        sink,
        Event::new(EventType::PushCompleted, task_id, Utc::now())
            .with_metadata_entry("auto_commit_sha", commit_sha.clone()),
    )
    .await;
    emit(
        sink,
        Event::new(EventType::MergeLanded, task_id, Utc::now())
            .with_metadata_entry("landing_status", "landed")
            .with_metadata_entry("auto_commit_sha", commit_sha.clone()),
    )
    .await;

    LandOutcome::Closed { commit_sha }
}

async fn blocked(
    sink: &dyn EventSink,
    task_id: &str,
    reason: String,
    commit_sha: Option<String>,
) -> LandOutcome {
    let mut event = Event::new(EventType::MergeBlocked, task_id, Utc::now())
        .with_metadata_entry("landing_status", "blocked")
        .with_message(reason.clone());
    if let Some(sha) = &commit_sha {
        event = event.with_metadata_entry("auto_commit_sha", sha.clone());
    }
    emit(sink, event).await;
    LandOutcome::Blocked { reason, commit_sha }
}

async fn emit(sink: &dyn EventSink, event: Event) {
    if let Err(e) = sink.emit(event).await {
        tracing::warn!(error = %e, "failed to emit landing event (best-effort)");
    }
}
