//! Activity log collaborators.
//!
//! Orchestrators record transfer start, a milestone every ten batches,
//! completion, failure and cancellation. Recording is best-effort: a logger
//! error is logged and swallowed, never propagated into the transfer.

use crate::transfer::progress::TransferProgress;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Shared activity logger handle.
pub type SharedActivityLogger = Arc<dyn ActivityLogger>;

/// Kind of activity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Transfer started
    TransferStarted,
    /// Periodic batch milestone
    TransferMilestone,
    /// Transfer completed (possibly with failed records)
    TransferCompleted,
    /// Transfer failed
    TransferFailed,
    /// Transfer cancelled
    TransferCancelled,
}

/// One activity log entry.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    /// Event kind
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    /// Human-readable description
    pub description: String,
    /// Structured details
    pub details: Value,
    /// When the event was created
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    /// Build an event with the current timestamp.
    pub fn new(kind: ActivityKind, description: impl Into<String>, details: Value) -> Self {
        Self {
            kind,
            description: description.into(),
            details,
            timestamp: Utc::now(),
        }
    }

    /// Event describing a transfer snapshot.
    pub fn for_progress(
        kind: ActivityKind,
        description: impl Into<String>,
        progress: &TransferProgress,
    ) -> Self {
        Self::new(
            kind,
            description,
            json!({
                "transferId": progress.transfer_id,
                "totalRecords": progress.total_records,
                "processedRecords": progress.processed_records,
                "failedRecords": progress.failed_records,
                "skippedRecords": progress.skipped_records,
                "currentBatch": progress.current_batch,
                "totalBatches": progress.total_batches,
                "percentage": progress.percentage,
                "status": progress.status,
                "lastError": progress.last_error,
            }),
        )
    }
}

/// Activity log errors
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    /// IO failure writing the log
    #[error("activity log IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Event could not be serialized
    #[error("activity log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote sink rejected the event
    #[error("activity log rejected event: {0}")]
    Rejected(String),
}

/// Sink for transfer activity events.
#[async_trait]
pub trait ActivityLogger: Send + Sync {
    /// Record one event.
    async fn record(&self, event: ActivityEvent) -> Result<(), ActivityError>;
}

/// Record an event, logging and discarding any failure.
pub async fn record_best_effort(logger: Option<&SharedActivityLogger>, event: ActivityEvent) {
    let Some(logger) = logger else {
        return;
    };
    let kind = event.kind;
    if let Err(e) = logger.record(event).await {
        warn!(kind = ?kind, error = %e, "Failed to record activity event");
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopActivityLog;

#[async_trait]
impl ActivityLogger for NoopActivityLog {
    async fn record(&self, _event: ActivityEvent) -> Result<(), ActivityError> {
        Ok(())
    }
}

/// Emits events as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLog;

#[async_trait]
impl ActivityLogger for TracingActivityLog {
    async fn record(&self, event: ActivityEvent) -> Result<(), ActivityError> {
        info!(
            kind = ?event.kind,
            details = %event.details,
            "{}",
            event.description
        );
        Ok(())
    }
}

/// Appends one JSON object per event to a file.
#[derive(Debug)]
pub struct JsonLinesActivityLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesActivityLog {
    /// Log appending to `path`; the file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// File the log appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ActivityLogger for JsonLinesActivityLog {
    async fn record(&self, event: ActivityEvent) -> Result<(), ActivityError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
