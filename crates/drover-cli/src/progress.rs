//! Plain-text progress renderer: a terminal-friendly [`EventSink`] that
//! turns the structured event stream into one line per event, the way
//! an operator watching a foreground run expects. Meant to be fanned
//! out alongside the durable JSONL sinks, never in place of them.

use async_trait::async_trait;
use drover_core::adapters::{AdapterResult, EventSink};
use drover_core::events::{Event, EventType};

pub struct TextProgressSink;

impl TextProgressSink {
    pub fn new() -> Self {
        TextProgressSink
    }
}

impl Default for TextProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

fn render(event: &Event) -> String {
    let task = &event.task_id;
    match event.kind {
        EventType::RunStarted => format!("[run] started (root {task})"),
        EventType::TaskStarted => format!("[{task}] started"),
        EventType::TaskFinished => {
            let status = event.message.as_deref().unwrap_or("unknown");
            format!("[{task}] finished: {status}")
        }
        EventType::TaskStatusSet => format!("[{task}] status -> {}", event.message.as_deref().unwrap_or("?")),
        EventType::TaskDataUpdated => format!("[{task}] metadata updated"),
        EventType::RunnerStarted => format!("[{task}] agent started"),
        EventType::RunnerFinished => {
            let status = event.message.as_deref().unwrap_or("unknown");
            format!("[{task}] agent finished: {status}")
        }
        EventType::RunnerProgress => format!("[{task}] {}", event.message.as_deref().unwrap_or("")),
        EventType::RunnerHeartbeat => format!("[{task}] (still running)"),
        EventType::RunnerCmdStarted => format!("[{task}] $ {}", event.message.as_deref().unwrap_or("")),
        EventType::RunnerCmdFinished => format!("[{task}] command finished"),
        EventType::RunnerOutput => format!("[{task}] {}", event.message.as_deref().unwrap_or("")),
        EventType::RunnerWarning => format!("[{task}] warning: {}", event.message.as_deref().unwrap_or("")),
        EventType::ReviewStarted => format!("[{task}] review started"),
        EventType::ReviewFinished => format!("[{task}] review finished: {}", event.message.as_deref().unwrap_or("?")),
        EventType::BranchCreated => format!("[{task}] branch created"),
        EventType::MergeQueued => format!("[{task}] queued for landing"),
        EventType::MergeRetry => format!("[{task}] merge retry"),
        EventType::MergeBlocked => format!("[{task}] landing blocked: {}", event.message.as_deref().unwrap_or("?")),
        EventType::MergeLanded => format!("[{task}] landed"),
        EventType::MergeCompleted => format!("[{task}] merge completed"),
        EventType::PushCompleted => format!("[{task}] pushed"),
    }
}

#[async_trait]
impl EventSink for TextProgressSink {
    async fn emit(&self, event: Event) -> AdapterResult<()> {
        println!("{}", render(&event));
        Ok(())
    }
}
