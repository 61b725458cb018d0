//! Subprocess agent runner: spawns the configured CLI binary per
//! request, streams its JSONL output, and folds it down into one
//! [`RunnerResult`].
//!
//! The request/response shape here is simpler than a persistent
//! harness handle: one [`AgentRunner::run`] call owns the whole
//! spawn-stream-wait-kill lifecycle for a single prompt, since the
//! scheduler never resumes a conversation across calls.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use drover_core::adapters::{
    AdapterError, AdapterResult, AgentRunner, RunnerMode, RunnerProgress, RunnerRequest, RunnerResult,
    RunnerStatus,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Runs prompts through a `claude -p --output-format stream-json`
/// style CLI. `binary_path` defaults to `"claude"` on `$PATH`.
pub struct CliAgentRunner {
    binary_path: String,
    extra_args: Vec<String>,
}

impl CliAgentRunner {
    pub fn new() -> Self {
        CliAgentRunner { binary_path: "claude".to_string(), extra_args: Vec::new() }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        CliAgentRunner { binary_path: path.into(), extra_args: Vec::new() }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

impl Default for CliAgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct FoldedOutput {
    last_message: Option<String>,
    review_verdict: Option<String>,
    review_fail_feedback: Option<String>,
    saw_error: Option<String>,
}

fn fold_stream_json_line(line: &str, folded: &mut FoldedOutput, on_progress: &Option<drover_core::adapters::ProgressCallback>) {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
        return;
    };
    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        "assistant" => {
            if let Some(content) = v.get("message").and_then(|m| m.get("content")).and_then(|c| c.as_array()) {
                for block in content {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            fold_review_markers(text, folded);
                            folded.last_message = Some(text.to_string());
                            if let Some(cb) = on_progress {
                                cb(RunnerProgress::Output(text.to_string()));
                            }
                        }
                    } else if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                        let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("unknown");
                        if let Some(cb) = on_progress {
                            cb(RunnerProgress::CommandStarted { command: name.to_string() });
                        }
                    }
                }
            }
        }
        "result" => {
            if let Some(text) = v.get("result").and_then(|r| r.as_str()) {
                fold_review_markers(text, folded);
                folded.last_message = Some(text.to_string());
            }
        }
        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            folded.saw_error = Some(message);
        }
        _ => {}
    }
}

/// Looks for `REVIEW_VERDICT: pass|fail` and a following
/// `REVIEW_FAIL_FEEDBACK:` block in a review agent's final message.
fn fold_review_markers(text: &str, folded: &mut FoldedOutput) {
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(verdict) = trimmed.strip_prefix("REVIEW_VERDICT:") {
            folded.review_verdict = Some(verdict.trim().to_lowercase());
        } else if let Some(feedback) = trimmed.strip_prefix("REVIEW_FAIL_FEEDBACK:") {
            folded.review_fail_feedback = Some(feedback.trim().to_string());
        }
    }
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    fn name(&self) -> &str {
        "cli"
    }

    async fn run(&self, request: RunnerRequest) -> AdapterResult<RunnerResult> {
        let started_at = Utc::now();
        let session_id = uuid::Uuid::new_v4().to_string();
        let allowed_tools = "Bash,Read,Edit,Write,Glob,Grep";

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--allowedTools")
            .arg(allowed_tools)
            .arg("--append-system-prompt")
            .arg(&request.prompt)
            .args(&self.extra_args)
            .current_dir(&request.repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AdapterError::Runner(format!("failed to spawn '{}': {e}", self.binary_path)))?;
        let stdout = child.stdout.take().ok_or_else(|| AdapterError::Runner("no stdout pipe on spawned agent".to_string()))?;

        let on_progress = request.on_progress;
        let last_output = Mutex::new(Instant::now());
        let read_and_wait = async {
            let mut folded = FoldedOutput::default();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    fold_stream_json_line(trimmed, &mut folded, &on_progress);
                    *last_output.lock().unwrap() = Instant::now();
                }
            }
            let status = child.wait().await;
            (folded, status)
        };

        let (folded, wait_result) = match tokio::time::timeout(request.timeout, read_and_wait).await {
            Ok(result) => result,
            Err(_) => {
                kill_child_best_effort(child.id());
                let last_output_age = last_output.lock().unwrap().elapsed();
                let mut artifacts = BTreeMap::new();
                artifacts.insert("session_id".to_string(), session_id);
                artifacts.insert("stall_category".to_string(), "runner_timeout".to_string());
                artifacts.insert("last_output_age".to_string(), format!("{last_output_age:?}"));
                return Ok(RunnerResult {
                    status: RunnerStatus::Blocked,
                    reason: Some(format!("runner timed out after {:?}", request.timeout)),
                    log_path: None,
                    artifacts,
                    started_at,
                    finished_at: Utc::now(),
                    review_ready: false,
                });
            }
        };

        let finished_at = Utc::now();
        let exit_status = wait_result
            .map_err(|e| AdapterError::Runner(format!("failed to wait on agent process: {e}")))?;

        let mut artifacts = BTreeMap::new();
        artifacts.insert("session_id".to_string(), session_id);
        if let Some(verdict) = &folded.review_verdict {
            artifacts.insert("review_verdict".to_string(), verdict.clone());
        }
        if let Some(feedback) = &folded.review_fail_feedback {
            artifacts.insert("review_fail_feedback".to_string(), feedback.clone());
        }

        if let Some(message) = folded.saw_error {
            return Ok(RunnerResult {
                status: RunnerStatus::Failed,
                reason: Some(message),
                log_path: None,
                artifacts,
                started_at,
                finished_at,
                review_ready: false,
            });
        }

        if !exit_status.success() {
            return Ok(RunnerResult {
                status: RunnerStatus::Failed,
                reason: Some(format!("agent process exited with {exit_status}")),
                log_path: None,
                artifacts,
                started_at,
                finished_at,
                review_ready: false,
            });
        }

        let review_ready = match request.mode {
            RunnerMode::Review => folded.review_verdict.as_deref() == Some("pass"),
            RunnerMode::Implement => true,
        };

        Ok(RunnerResult {
            status: RunnerStatus::Completed,
            reason: folded.last_message,
            log_path: None,
            artifacts,
            started_at,
            finished_at,
            review_ready,
        })
    }
}

/// The `Child` handle was borrowed by the now-dropped timed-out future,
/// so termination here goes by pid alone.
fn kill_child_best_effort(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    #[cfg(unix)]
    {
        // SAFETY: pid was obtained from a child we spawned moments ago.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}
