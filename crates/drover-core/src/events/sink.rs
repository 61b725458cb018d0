//! Concrete [`crate::adapters::EventSink`] implementations: `File`
//! (append-only JSONL), `Stream` (NDJSON with `runner_output`
//! coalescing), and `Fanout` (broadcast to child sinks).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::adapters::{AdapterError, AdapterResult, EventSink};
use crate::events::{marshal_event_jsonl, Event};

/// Append-only JSONL file sink. All writes are serialized per sink via
/// an internal mutex.
pub struct FileSink {
    file: Mutex<tokio::fs::File>,
    path: PathBuf,
}

impl FileSink {
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(FileSink {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for FileSink {
    async fn emit(&self, event: Event) -> AdapterResult<()> {
        let line = marshal_event_jsonl(&event)
            .map_err(|e| AdapterError::Sink(format!("failed to marshal event: {e}")))?;
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AdapterError::Sink(format!("failed to write to {}: {e}", self.path.display())))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| AdapterError::Sink(format!("failed to write to {}: {e}", self.path.display())))?;
        file.flush()
            .await
            .map_err(|e| AdapterError::Sink(format!("failed to flush {}: {e}", self.path.display())))?;
        Ok(())
    }
}

/// Configuration for [`StreamSink`]'s `runner_output` coalescing
/// behavior.
#[derive(Debug, Clone, Copy)]
pub struct StreamSinkConfig {
    /// Minimum spacing between two emitted `runner_output` events.
    pub output_interval: Duration,
    /// Maximum number of coalesced events tracked before older pending
    /// state is replaced (and the drop counter increments).
    pub max_pending: usize,
    /// When `true`, coalescing is disabled and every event is written
    /// as-is.
    pub verbose: bool,
}

impl Default for StreamSinkConfig {
    fn default() -> Self {
        StreamSinkConfig {
            output_interval: Duration::from_millis(150),
            max_pending: 64,
            verbose: false,
        }
    }
}

#[derive(Default)]
struct CoalesceState {
    pending: Option<Event>,
    pending_count: usize,
    drop_count: usize,
    last_emitted_at: Option<Instant>,
}

/// NDJSON stream sink with bounded `runner_output` coalescing.
///
/// Writes happen on a dedicated background task so [`EventSink::emit`]
/// never blocks on I/O; the background task owns the coalescing timer
/// and reads events off an internal channel.
pub struct StreamSink {
    tx: mpsc::Sender<Event>,
}

impl StreamSink {
    pub fn new<W>(writer: W, config: StreamSinkConfig) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(run_stream_sink(writer, config, rx));
        StreamSink { tx }
    }
}

#[async_trait]
impl EventSink for StreamSink {
    async fn emit(&self, event: Event) -> AdapterResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| AdapterError::Sink("stream sink background task has stopped".to_string()))
    }
}

async fn run_stream_sink<W>(mut writer: W, config: StreamSinkConfig, mut rx: mpsc::Receiver<Event>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut state = CoalesceState::default();
    let mut ticker = tokio::time::interval(config.output_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => handle_event(event, &mut state, &mut writer, &config).await,
                    None => {
                        flush_pending(&mut state, &mut writer).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                maybe_flush_due(&mut state, &mut writer, &config).await;
            }
        }
    }
}

async fn handle_event<W: AsyncWrite + Unpin>(
    event: Event,
    state: &mut CoalesceState,
    writer: &mut W,
    config: &StreamSinkConfig,
) {
    if config.verbose {
        flush_pending(state, writer).await;
        write_event(writer, &event).await;
        if event.is_runner_output() {
            state.last_emitted_at = Some(Instant::now());
        }
        return;
    }

    if !event.is_runner_output() {
        flush_pending(state, writer).await;
        write_event(writer, &event).await;
        return;
    }

    let now = Instant::now();
    let due = state
        .last_emitted_at
        .map(|last| now.duration_since(last) >= config.output_interval)
        .unwrap_or(true);

    if due {
        flush_pending(state, writer).await;
        write_event(writer, &event).await;
        state.last_emitted_at = Some(now);
    } else {
        state.pending_count += 1;
        if state.pending_count > config.max_pending {
            state.drop_count += 1;
        }
        state.pending = Some(event);
    }
}

async fn maybe_flush_due<W: AsyncWrite + Unpin>(
    state: &mut CoalesceState,
    writer: &mut W,
    config: &StreamSinkConfig,
) {
    if state.pending.is_none() {
        return;
    }
    let due = state
        .last_emitted_at
        .map(|last| last.elapsed() >= config.output_interval)
        .unwrap_or(true);
    if due {
        flush_pending(state, writer).await;
    }
}

async fn flush_pending<W: AsyncWrite + Unpin>(state: &mut CoalesceState, writer: &mut W) {
    let Some(mut event) = state.pending.take() else {
        return;
    };
    if state.pending_count > 1 {
        event = event.with_metadata_entry("coalesced_outputs", (state.pending_count - 1).to_string());
    }
    if state.drop_count > 0 {
        event = event.with_metadata_entry("dropped_outputs", state.drop_count.to_string());
    }
    write_event(writer, &event).await;
    state.last_emitted_at = Some(Instant::now());
    state.pending_count = 0;
    state.drop_count = 0;
}

async fn write_event<W: AsyncWrite + Unpin>(writer: &mut W, event: &Event) {
    let Ok(line) = marshal_event_jsonl(event) else {
        return;
    };
    let _ = writer.write_all(line.as_bytes()).await;
    let _ = writer.write_all(b"\n").await;
    let _ = writer.flush().await;
}

/// Broadcasts to all child sinks, aggregating errors.
pub struct FanoutSink {
    children: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(children: Vec<Arc<dyn EventSink>>) -> Self {
        FanoutSink { children }
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn emit(&self, event: Event) -> AdapterResult<()> {
        let mut errors = Vec::new();
        for child in &self.children {
            if let Err(e) = child.emit(event.clone()).await {
                errors.push(e.to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AdapterError::Sink(errors.join("; ")))
        }
    }
}
