//! Progress tracking for batch and streaming transfers.
//!
//! [`TransferProgress`] is the single progress record owned by one running
//! transfer. [`ProgressTracker`] folds batch outcomes into it: counters,
//! percentage, a history-smoothed processing rate and an ETA that is itself
//! smoothed so one abnormally slow or fast batch does not make it jump.

use crate::transfer::config::{
    ASSUMED_RECORD_SIZE, PROGRESS_HISTORY_LEN, SMOOTHING_PREVIOUS, SMOOTHING_SAMPLE,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Created, no batch has completed yet.
    Initializing,
    /// Batches are being processed.
    InProgress,
    /// Held at a group boundary until resumed.
    Paused,
    /// Every record was handled (successfully or not).
    Completed,
    /// The source could not be read any further.
    Failed,
    /// Stopped on request before every record was handled.
    Cancelled,
}

impl TransferStatus {
    /// Whether no further transitions are allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Forward-only transitions, except `paused` <-> `in_progress`.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (a, _) if a.is_terminal() => false,
            (_, Initializing) => false,
            (Initializing, _) => true,
            (InProgress, _) => true,
            (Paused, _) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Coarse classification of how a transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    /// Not terminal yet.
    Running,
    /// Completed with zero failed records.
    Succeeded,
    /// Completed, but some records failed.
    CompletedWithErrors,
    /// Terminal `failed` status.
    Failed,
    /// Terminal `cancelled` status.
    Cancelled,
}

/// One sample of the processing history.
#[derive(Debug, Clone, Copy)]
pub struct ProgressPoint {
    /// When the sample was taken.
    pub at: Instant,
    /// Records handled (processed + failed) at that moment.
    pub processed_count: u64,
    /// Records/second since the previous sample.
    pub instantaneous_rate: f64,
}

/// Progress of one transfer invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Correlation id for logs and activity events.
    pub transfer_id: Uuid,
    /// Total records expected (grows on open-ended streaming sources).
    pub total_records: u64,
    /// Records processed successfully.
    pub processed_records: u64,
    /// Records that failed.
    pub failed_records: u64,
    /// Records skipped as duplicates, never processed.
    pub skipped_records: u64,
    /// `floor(processed / total * 100)`, 0 when `total` is 0.
    pub percentage: u8,
    /// 1-based index of the most recently completed batch.
    pub current_batch: usize,
    /// Number of batches planned so far.
    pub total_batches: usize,
    /// Wall-clock start of the transfer.
    pub start_time: DateTime<Utc>,
    /// Smoothed records/second.
    pub processing_rate: f64,
    /// Highest smoothed rate observed.
    pub peak_processing_rate: f64,
    /// Smoothed seconds remaining, `None` until a batch completes.
    pub estimated_time_remaining: Option<f64>,
    /// Lifecycle state.
    pub status: TransferStatus,
    /// Advisory bytes processed.
    pub data_volume: u64,
    /// Most recent item or source error message.
    pub last_error: Option<String>,
    #[serde(skip)]
    pub(crate) processing_history: VecDeque<ProgressPoint>,
    #[serde(skip)]
    pub(crate) started_at: Instant,
    #[serde(skip)]
    pub(crate) open_ended: bool,
}

impl TransferProgress {
    /// Fresh progress for a transfer with a known record count.
    pub fn new(total_records: u64, total_batches: usize) -> Self {
        Self {
            transfer_id: Uuid::new_v4(),
            total_records,
            processed_records: 0,
            failed_records: 0,
            skipped_records: 0,
            percentage: 0,
            current_batch: 0,
            total_batches,
            start_time: Utc::now(),
            processing_rate: 0.0,
            peak_processing_rate: 0.0,
            estimated_time_remaining: None,
            status: TransferStatus::Initializing,
            data_volume: 0,
            last_error: None,
            processing_history: VecDeque::with_capacity(PROGRESS_HISTORY_LEN),
            started_at: Instant::now(),
            open_ended: false,
        }
    }

    /// Fresh progress for a source whose size is only estimated.
    ///
    /// The transfer cannot reach `completed` through counters alone; the
    /// streaming orchestrator finishes it once the source is exhausted.
    pub fn open_ended(estimated_total: Option<u64>) -> Self {
        let mut progress = Self::new(estimated_total.unwrap_or(0), 0);
        progress.open_ended = true;
        progress
    }

    /// Records handled so far, successfully or not.
    pub fn handled_records(&self) -> u64 {
        self.processed_records + self.failed_records
    }

    /// Records still to be handled.
    pub fn remaining_records(&self) -> u64 {
        self.total_records.saturating_sub(self.handled_records())
    }

    /// Samples currently in the smoothing window.
    pub fn history(&self) -> impl Iterator<Item = &ProgressPoint> {
        self.processing_history.iter()
    }

    /// Whether the total is still an estimate.
    pub fn is_open_ended(&self) -> bool {
        self.open_ended
    }

    /// Time since the transfer started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Classify the current state.
    pub fn outcome(&self) -> TransferOutcome {
        match self.status {
            TransferStatus::Completed if self.failed_records == 0 => TransferOutcome::Succeeded,
            TransferStatus::Completed => TransferOutcome::CompletedWithErrors,
            TransferStatus::Failed => TransferOutcome::Failed,
            TransferStatus::Cancelled => TransferOutcome::Cancelled,
            _ => TransferOutcome::Running,
        }
    }

    /// Completed without a single failed record.
    pub fn is_success(&self) -> bool {
        self.outcome() == TransferOutcome::Succeeded
    }

    /// Human-readable progress line for logging.
    pub fn format_progress(&self) -> String {
        let mut parts = vec![format!(
            "[PROGRESS] Transferred {}/{} records - {}% complete",
            self.processed_records, self.total_records, self.percentage
        )];

        if self.total_batches > 0 {
            parts.push(format!(
                "(batch {}/{})",
                self.current_batch, self.total_batches
            ));
        }

        if self.processing_rate > 0.0 {
            parts.push(format!("at {:.0} records/sec", self.processing_rate));
        }

        if let Some(eta) = self.estimated_time_remaining {
            if eta > 0.0 && eta.is_finite() {
                parts.push(format!(
                    "- ~{} remaining",
                    format_duration(Duration::from_secs_f64(eta))
                ));
            }
        }

        if self.failed_records > 0 {
            parts.push(format!("- {} failed", self.failed_records));
        }

        parts.join(" ")
    }

    fn set_status(&mut self, next: TransferStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    fn refresh_percentage(&mut self) {
        self.percentage = if self.total_records == 0 {
            0
        } else {
            (self.processed_records.saturating_mul(100) / self.total_records).min(100) as u8
        };
    }
}

/// Folds batch outcomes into a [`TransferProgress`].
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    history_len: usize,
    assumed_record_size: u64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(PROGRESS_HISTORY_LEN, ASSUMED_RECORD_SIZE)
    }
}

impl ProgressTracker {
    /// Tracker with a custom history window and record size heuristic.
    pub fn new(history_len: usize, assumed_record_size: u64) -> Self {
        Self {
            history_len: history_len.max(1),
            assumed_record_size,
        }
    }

    /// Move a fresh transfer into `in_progress`.
    pub fn start(&self, progress: &mut TransferProgress) {
        if progress.status == TransferStatus::Initializing {
            progress.set_status(TransferStatus::InProgress);
        }
    }

    /// Apply the outcome of one batch.
    pub fn update(
        &self,
        progress: &mut TransferProgress,
        processed_delta: u64,
        failed_delta: u64,
        batch_index: usize,
    ) {
        self.update_at(
            progress,
            processed_delta,
            failed_delta,
            batch_index,
            Instant::now(),
        );
    }

    /// Apply the outcome of one batch observed at `now`.
    pub fn update_at(
        &self,
        progress: &mut TransferProgress,
        processed_delta: u64,
        failed_delta: u64,
        batch_index: usize,
        now: Instant,
    ) {
        if progress.status.is_terminal() {
            return;
        }

        let previous_at = progress
            .processing_history
            .back()
            .map(|point| point.at)
            .unwrap_or(progress.started_at);

        progress.processed_records += processed_delta;
        progress.failed_records += failed_delta;
        if progress.open_ended {
            progress.total_records = progress.total_records.max(progress.handled_records());
        } else {
            debug_assert!(
                progress.handled_records() <= progress.total_records,
                "handled {} of {} known records",
                progress.handled_records(),
                progress.total_records
            );
        }
        progress.current_batch = batch_index + 1;
        progress.total_batches = progress.total_batches.max(progress.current_batch);
        progress.data_volume = progress
            .processed_records
            .saturating_mul(self.assumed_record_size);
        progress.refresh_percentage();

        let delta = processed_delta + failed_delta;
        let step_secs = now.saturating_duration_since(previous_at).as_secs_f64();
        let instantaneous_rate = if step_secs > 0.0 {
            delta as f64 / step_secs
        } else {
            0.0
        };

        progress.processing_history.push_back(ProgressPoint {
            at: now,
            processed_count: progress.handled_records(),
            instantaneous_rate,
        });
        while progress.processing_history.len() > self.history_len {
            progress.processing_history.pop_front();
        }

        let sample = span_rate(&progress.processing_history).unwrap_or(instantaneous_rate);
        if sample > 0.0 {
            progress.processing_rate = smooth(progress.processing_rate, sample);
            progress.peak_processing_rate =
                progress.peak_processing_rate.max(progress.processing_rate);
        }

        if progress.status != TransferStatus::Paused {
            progress.set_status(TransferStatus::InProgress);
        }

        if !progress.open_ended && progress.handled_records() >= progress.total_records {
            self.complete(progress);
            return;
        }

        if progress.processing_rate > 0.0 {
            let raw = progress.remaining_records() as f64 / progress.processing_rate;
            progress.estimated_time_remaining = Some(match progress.estimated_time_remaining {
                Some(previous) => smooth(previous, raw),
                None => raw,
            });
        }
    }

    /// Mark every record handled and close the transfer as `completed`.
    ///
    /// For open-ended sources the total collapses to what was actually handled.
    pub fn complete(&self, progress: &mut TransferProgress) {
        if progress.open_ended {
            progress.total_records = progress.handled_records();
            progress.open_ended = false;
        }
        if progress.set_status(TransferStatus::Completed) {
            progress.estimated_time_remaining = Some(0.0);
            progress.refresh_percentage();
        }
    }

    /// Close the transfer as `failed` with the given reason.
    pub fn fail(&self, progress: &mut TransferProgress, reason: impl Into<String>) {
        progress.last_error = Some(reason.into());
        if progress.set_status(TransferStatus::Failed) {
            progress.estimated_time_remaining = None;
        }
    }

    /// Close the transfer as `cancelled`.
    pub fn cancel(&self, progress: &mut TransferProgress) {
        if progress.set_status(TransferStatus::Cancelled) {
            progress.estimated_time_remaining = None;
        }
    }

    /// Hold a running transfer.
    pub fn pause(&self, progress: &mut TransferProgress) {
        if progress.status == TransferStatus::InProgress {
            progress.set_status(TransferStatus::Paused);
        }
    }

    /// Continue a paused transfer.
    pub fn resume(&self, progress: &mut TransferProgress) {
        if progress.status == TransferStatus::Paused {
            progress.set_status(TransferStatus::InProgress);
        }
    }
}

fn smooth(previous: f64, sample: f64) -> f64 {
    if previous > 0.0 {
        previous * SMOOTHING_PREVIOUS + sample * SMOOTHING_SAMPLE
    } else {
        sample
    }
}

/// Rate across the whole history window, `None` with fewer than two points.
fn span_rate(history: &VecDeque<ProgressPoint>) -> Option<f64> {
    if history.len() < 2 {
        return None;
    }
    let oldest = history.front()?;
    let newest = history.back()?;
    let span = newest.at.saturating_duration_since(oldest.at).as_secs_f64();
    if span <= 0.0 {
        return None;
    }
    Some(newest.processed_count.saturating_sub(oldest.processed_count) as f64 / span)
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
