//! Out-of-band progress updates for long-running commands.
//!
//! Progress is deliberately not correlated through the pending-call table.
//! A handler publishes [`ProgressUpdate`]s keyed by its own command id, the
//! transport forwards them as `progress_update` frames, and the receiving side
//! republishes them on a [`ProgressStream`] for whoever wants to display them.
//! A `completed` update is only a hint; the correlated reply is authoritative.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default number of updates a slow subscriber may fall behind by.
pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

/// Lifecycle stage reported by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    InProgress,
    Completed,
    Error,
}

impl ProgressStatus {
    /// `completed` and `error` end a progress sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Position of the current chunk in a chunked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    /// 1-based index of the chunk just processed.
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub chunk_size: u32,
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Id of the tracked operation; not necessarily a request id.
    pub command_id: String,
    /// Command name, for display.
    pub command_type: String,
    pub status: ProgressStatus,
    /// Percentage, 0–100.
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub total_items: u64,
    #[serde(default)]
    pub processed_items: u64,
    #[serde(default)]
    pub message: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ProgressUpdate {
    /// Create an update stamped with the current time.
    pub fn new(
        command_id: impl Into<String>,
        command_type: impl Into<String>,
        status: ProgressStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            command_type: command_type.into(),
            status,
            progress: if status == ProgressStatus::Completed { 100 } else { 0 },
            total_items: 0,
            processed_items: 0,
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            chunk: None,
            payload: None,
        }
    }

    /// Set item counts and derive the percentage from them.
    pub fn with_items(mut self, processed: u64, total: u64) -> Self {
        self.processed_items = processed.min(total);
        self.total_items = total;
        if total > 0 {
            self.progress = ((self.processed_items * 100) / total) as u8;
        }
        self
    }

    /// Override the percentage (clamped to 100).
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }

    pub fn with_chunk(mut self, chunk: ChunkInfo) -> Self {
        self.chunk = Some(chunk);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Builds the updates for one tracked operation.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    command_id: String,
    command_type: String,
    total_items: u64,
}

impl ProgressTracker {
    pub fn new(
        command_id: impl Into<String>,
        command_type: impl Into<String>,
        total_items: u64,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            command_type: command_type.into(),
            total_items,
        }
    }

    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    fn update(&self, status: ProgressStatus, message: impl Into<String>) -> ProgressUpdate {
        ProgressUpdate::new(&self.command_id, &self.command_type, status, message)
    }

    pub fn started(&self, message: impl Into<String>) -> ProgressUpdate {
        self.update(ProgressStatus::Started, message)
            .with_items(0, self.total_items)
    }

    pub fn advanced(&self, processed: u64, message: impl Into<String>) -> ProgressUpdate {
        self.update(ProgressStatus::InProgress, message)
            .with_items(processed, self.total_items)
    }

    pub fn chunk(
        &self,
        processed: u64,
        chunk: ChunkInfo,
        message: impl Into<String>,
    ) -> ProgressUpdate {
        self.advanced(processed, message).with_chunk(chunk)
    }

    pub fn completed(&self, message: impl Into<String>) -> ProgressUpdate {
        self.update(ProgressStatus::Completed, message)
            .with_items(self.total_items, self.total_items)
            .with_progress(100)
    }

    /// Terminal error update; keeps the percentage reached so far.
    pub fn failed(&self, processed: u64, message: impl Into<String>) -> ProgressUpdate {
        self.update(ProgressStatus::Error, message)
            .with_items(processed, self.total_items)
    }
}

/// Publish/subscribe stream of progress updates.
///
/// Backed by a broadcast channel: every subscriber has its own cursor, a
/// subscriber that falls behind loses the oldest updates, and publishing
/// never blocks or fails when nobody is listening.
#[derive(Debug, Clone)]
pub struct ProgressStream {
    tx: broadcast::Sender<ProgressUpdate>,
}

impl Default for ProgressStream {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_CAPACITY)
    }
}

impl ProgressStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an update. Returns how many subscribers it reached.
    pub fn publish(&self, update: ProgressUpdate) -> usize {
        tracing::trace!(
            command_id = %update.command_id,
            status = %update.status,
            progress = update.progress,
            "Publishing progress"
        );
        self.tx.send(update).unwrap_or(0)
    }

    /// Subscribe to updates published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Run `listener` for every update in its own task.
    ///
    /// Errors returned by the listener are logged and the listener keeps
    /// receiving. A panic ends only this listener's task.
    pub fn listen<F, E>(&self, name: impl Into<String>, mut listener: F) -> JoinHandle<()>
    where
        F: FnMut(ProgressUpdate) -> Result<(), E> + Send + 'static,
        E: Display,
    {
        let name = name.into();
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => {
                        let command_id = update.command_id.clone();
                        if let Err(e) = listener(update) {
                            tracing::warn!(
                                listener = %name,
                                command_id = %command_id,
                                error = %e,
                                "Progress listener failed"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(listener = %name, skipped, "Progress listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::trace!(listener = %name, "Progress listener stopped");
        })
    }
}
