//! Generic CLI-backed tracker adapter.
//!
//! Shells out to a tracker binary's JSON-emitting subcommands (`tk
//! show`, `tk next`, `tk tree`, ...) and parses their stdout the same
//! way [`crate::runner::CliAgentRunner`] parses an agent's stream --
//! one subprocess call per operation, JSON decoded, mapped onto the
//! engine's types. `GetTask`'s field-by-field construction mirrors the
//! spirit of a materializer that assembles a task record from several
//! underlying columns, without the markdown formatting such a
//! materializer produces for a prompt document -- the tracker here
//! hands back structured data, not prose.

use std::collections::BTreeMap;

use async_trait::async_trait;
use drover_core::adapters::{AdapterError, AdapterResult, TaskManager};
use drover_core::graph::TaskSummary;
use drover_core::task::{EdgeKind, Task, TaskRelation, TaskStatus};
use serde::Deserialize;
use tokio::process::Command;

pub struct CliTaskManager {
    binary_path: String,
}

impl CliTaskManager {
    pub fn new() -> Self {
        CliTaskManager { binary_path: "tk".to_string() }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        CliTaskManager { binary_path: path.into() }
    }

    async fn run_json(&self, args: &[&str]) -> AdapterResult<serde_json::Value> {
        let output = Command::new(&self.binary_path)
            .args(args)
            .output()
            .await
            .map_err(|e| AdapterError::Tracker(format!("failed to spawn '{}': {e}", self.binary_path)))?;
        if !output.status.success() {
            return Err(AdapterError::Tracker(format!(
                "{} {} failed: {}",
                self.binary_path,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| AdapterError::Tracker(format!("malformed JSON from {}: {e}", self.binary_path)))
    }

    async fn run_ok(&self, args: &[&str]) -> AdapterResult<()> {
        let output = Command::new(&self.binary_path)
            .args(args)
            .output()
            .await
            .map_err(|e| AdapterError::Tracker(format!("failed to spawn '{}': {e}", self.binary_path)))?;
        if !output.status.success() {
            return Err(AdapterError::Tracker(format!(
                "{} {} failed: {}",
                self.binary_path,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

impl Default for CliTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct RawTask {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    status: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl TryFrom<RawTask> for Task {
    type Error = AdapterError;

    fn try_from(raw: RawTask) -> Result<Self, Self::Error> {
        let status = raw
            .status
            .parse::<TaskStatus>()
            .map_err(|e| AdapterError::Tracker(e.to_string()))?;
        Ok(Task { id: raw.id, title: raw.title, description: raw.description, status, parent: raw.parent, metadata: raw.metadata })
    }
}

#[derive(Debug, Deserialize)]
struct RawRelation {
    kind: String,
    from: String,
    to: String,
}

fn parse_edge_kind(raw: &str) -> AdapterResult<EdgeKind> {
    match raw {
        "parent" => Ok(EdgeKind::Parent),
        "depends_on" => Ok(EdgeKind::DependsOn),
        "blocks" => Ok(EdgeKind::Blocks),
        other => Err(AdapterError::Tracker(format!("unknown relation kind {other:?}"))),
    }
}

#[async_trait]
impl TaskManager for CliTaskManager {
    async fn next_tasks(&self, parent: &str) -> AdapterResult<Vec<TaskSummary>> {
        let value = self.run_json(&["next", "--parent", parent, "--json"]).await?;
        let raw: Vec<RawTask> = serde_json::from_value(value)
            .map_err(|e| AdapterError::Tracker(format!("malformed next-tasks payload: {e}")))?;
        raw.into_iter()
            .map(|r| {
                let priority = r.metadata.get("priority").and_then(|p| p.trim().parse::<i64>().ok()).unwrap_or(Task::DEFAULT_PRIORITY);
                Ok(TaskSummary { id: r.id, title: r.title, priority })
            })
            .collect()
    }

    async fn get_task(&self, id: &str) -> AdapterResult<Task> {
        let value = self.run_json(&["show", id, "--json"]).await?;
        let raw: RawTask =
            serde_json::from_value(value).map_err(|e| AdapterError::Tracker(format!("malformed task payload: {e}")))?;
        raw.try_into()
    }

    async fn set_task_status(&self, id: &str, status: TaskStatus) -> AdapterResult<()> {
        self.run_ok(&["set-status", id, &status.to_string()]).await
    }

    async fn set_task_data(&self, id: &str, data: BTreeMap<String, String>) -> AdapterResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut args: Vec<String> = vec!["set-data".to_string(), id.to_string()];
        args.extend(data.iter().map(|(k, v)| format!("{k}={v}")));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_ok(&arg_refs).await
    }

    async fn get_task_tree(&self, parent: &str) -> AdapterResult<(Vec<Task>, Vec<TaskRelation>)> {
        let value = self.run_json(&["tree", parent, "--json"]).await?;
        let tasks_value = value.get("tasks").cloned().unwrap_or(serde_json::Value::Array(vec![]));
        let relations_value = value.get("relations").cloned().unwrap_or(serde_json::Value::Array(vec![]));

        let raw_tasks: Vec<RawTask> = serde_json::from_value(tasks_value)
            .map_err(|e| AdapterError::Tracker(format!("malformed task tree payload: {e}")))?;
        let raw_relations: Vec<RawRelation> = serde_json::from_value(relations_value)
            .map_err(|e| AdapterError::Tracker(format!("malformed relation payload: {e}")))?;

        let tasks: Vec<Task> = raw_tasks.into_iter().map(Task::try_from).collect::<Result<_, _>>()?;
        let relations: Vec<TaskRelation> = raw_relations
            .into_iter()
            .map(|r| Ok(TaskRelation { kind: parse_edge_kind(&r.kind)?, from: r.from, to: r.to }))
            .collect::<AdapterResult<_>>()?;

        Ok((tasks, relations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_task_converts_when_status_parses() {
        let raw = RawTask {
            id: "t-1".to_string(),
            title: "Add retries".to_string(),
            description: String::new(),
            status: "open".to_string(),
            parent: None,
            metadata: BTreeMap::new(),
        };
        let task: Task = raw.try_into().unwrap();
        assert_eq!(task.status, TaskStatus::Open);
    }

    #[test]
    fn raw_task_rejects_unknown_status() {
        let raw = RawTask {
            id: "t-1".to_string(),
            title: "x".to_string(),
            description: String::new(),
            status: "pending".to_string(),
            parent: None,
            metadata: BTreeMap::new(),
        };
        let err = Task::try_from(raw).unwrap_err();
        assert!(err.to_string().contains("pending"));
    }

    #[test]
    fn parse_edge_kind_rejects_unknown_kind() {
        assert!(parse_edge_kind("transitively_blocks").is_err());
    }
}
