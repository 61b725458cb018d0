//! Event pipeline: typed lifecycle events, NDJSON marshal/parse, and
//! fan-out to sinks with bounded coalescing of high-volume
//! `runner_output` events.

mod sink;

pub use sink::{FanoutSink, FileSink, StreamSink, StreamSinkConfig};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exhaustive event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    TaskStarted,
    TaskFinished,
    TaskStatusSet,
    TaskDataUpdated,
    RunnerStarted,
    RunnerFinished,
    RunnerProgress,
    RunnerHeartbeat,
    RunnerCmdStarted,
    RunnerCmdFinished,
    RunnerOutput,
    RunnerWarning,
    ReviewStarted,
    ReviewFinished,
    BranchCreated,
    MergeQueued,
    MergeRetry,
    MergeBlocked,
    MergeLanded,
    MergeCompleted,
    PushCompleted,
}

/// A structured lifecycle event. Field order is stable and intentional:
/// `type, task_id, task_title?, worker_id?, clone_path?, queue_pos?,
/// message?, metadata?, ts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clone_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_pos: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    pub ts: DateTime<Utc>,
}

impl Event {
    /// Construct a minimal event of the given type for `task_id` at
    /// `ts`. Callers set the optional fields with the builder methods
    /// below.
    pub fn new(kind: EventType, task_id: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Event {
            kind,
            task_id: task_id.into(),
            task_title: None,
            worker_id: None,
            clone_path: None,
            queue_pos: None,
            message: None,
            metadata: None,
            ts,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.task_title = Some(title.into());
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_clone_path(mut self, path: impl Into<String>) -> Self {
        self.clone_path = Some(path.into());
        self
    }

    pub fn with_queue_pos(mut self, pos: u32) -> Self {
        self.queue_pos = Some(pos);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        if metadata.is_empty() {
            self.metadata = None;
        } else {
            self.metadata = Some(metadata);
        }
        self
    }

    /// Merge a single metadata key into this event, creating the map if
    /// absent.
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn is_runner_output(&self) -> bool {
        self.kind == EventType::RunnerOutput
    }
}

/// Serialize an event as a single NDJSON line (no trailing newline).
pub fn marshal_event_jsonl(event: &Event) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Parse a single NDJSON line back into an [`Event`].
pub fn parse_event_jsonl_line(line: &str) -> Result<Event, serde_json::Error> {
    serde_json::from_str(line)
}
