//! Batch transfer orchestration for materialized collections
//!
//! [`TransferOrchestrator::run`] plans the input into batches, drives them
//! window by window (`concurrent_batches * 2` batches per window, dispatched
//! in groups of `concurrent_batches`), folds each batch outcome into the
//! progress record and reports it through the progress callback.
//!
//! Batches of a group run concurrently on the calling task; groups run
//! strictly one after another with a short pause in between. Each batch is
//! reported exactly once, in completion order.

use crate::control::{sleep_unless_cancelled, SharedControl};
use crate::metrics::{self, TransferMetrics};
use crate::transfer::activity::{
    record_best_effort, ActivityEvent, ActivityKind, SharedActivityLogger,
};
use crate::transfer::config::{BatchConfig, MILESTONE_BATCH_INTERVAL};
use crate::transfer::executor::{BatchExecutor, ItemError};
use crate::transfer::planner::{Batch, BatchPlanner};
use crate::transfer::progress::{ProgressTracker, TransferProgress, TransferStatus};
use crate::transfer::TransferError;
use futures::stream::FuturesUnordered;
use futures_util::StreamExt;
use std::future::Future;
use tracing::{debug, info, info_span, warn, Instrument};

/// How a run of batches ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriveResult {
    Finished,
    Cancelled,
}

/// Window driver shared by the batch and streaming orchestrators.
///
/// Holds the counters that must survive across pages of a streaming source:
/// the group pause is applied between any two groups, and milestones are
/// counted over every batch of the transfer.
pub(crate) struct BatchDriver<'a> {
    config: &'a BatchConfig,
    tracker: &'a ProgressTracker,
    executor: BatchExecutor,
    activity: Option<&'a SharedActivityLogger>,
    control: Option<&'a SharedControl>,
    groups_started: usize,
    batches_finished: usize,
}

impl<'a> BatchDriver<'a> {
    pub(crate) fn new(
        config: &'a BatchConfig,
        tracker: &'a ProgressTracker,
        activity: Option<&'a SharedActivityLogger>,
        control: Option<&'a SharedControl>,
    ) -> Self {
        Self {
            config,
            tracker,
            executor: BatchExecutor::from_config(config).with_control(control.cloned()),
            activity,
            control,
            groups_started: 0,
            batches_finished: 0,
        }
    }

    /// Drive `batches` to completion, or until cancellation is observed.
    pub(crate) async fn drive<T, F, Fut, C>(
        &mut self,
        batches: Vec<Batch<T>>,
        process: &F,
        progress: &mut TransferProgress,
        on_progress: &mut C,
    ) -> DriveResult
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<bool, ItemError>>,
        C: FnMut(TransferProgress),
    {
        let planner = BatchPlanner::from_config(self.config);

        for window in planner.windows(batches) {
            for group in window {
                if !self.before_group(progress, on_progress).await {
                    return DriveResult::Cancelled;
                }
                self.groups_started += 1;

                debug!(
                    first_batch = group.first().map(|b| b.index),
                    batches = group.len(),
                    "Dispatching batch group"
                );

                let mut in_flight: FuturesUnordered<_> = group
                    .iter()
                    .map(|batch| self.executor.execute(batch, process))
                    .collect();

                let mut interrupted = false;
                let mut milestones = Vec::new();

                while let Some(outcome) = in_flight.next().await {
                    if outcome.interrupted {
                        interrupted = true;
                        continue;
                    }

                    self.tracker
                        .update(progress, outcome.succeeded, outcome.failed, outcome.index);
                    if let Some(error) = outcome.last_error() {
                        progress.last_error = Some(error.to_string());
                    }
                    metrics::record_batch(&outcome);
                    on_progress(progress.clone());

                    self.batches_finished += 1;
                    if self.batches_finished % MILESTONE_BATCH_INTERVAL == 0 {
                        info!("{}", progress.format_progress());
                        milestones.push(ActivityEvent::for_progress(
                            ActivityKind::TransferMilestone,
                            format!("{} batches transferred", self.batches_finished),
                            progress,
                        ));
                    }
                }
                drop(in_flight);

                for event in milestones {
                    record_best_effort(self.activity, event).await;
                }
                if interrupted {
                    return DriveResult::Cancelled;
                }
            }
        }

        DriveResult::Finished
    }

    /// Pause between groups and honour pause/cancel requests.
    async fn before_group<C>(&self, progress: &mut TransferProgress, on_progress: &mut C) -> bool
    where
        C: FnMut(TransferProgress),
    {
        let control = self.control.map(|c| &**c);

        if self.groups_started > 0
            && !self.config.group_pause.is_zero()
            && !sleep_unless_cancelled(control, self.config.group_pause).await
        {
            return false;
        }

        let Some(control) = control else {
            return true;
        };
        if control.is_cancelled() {
            return false;
        }
        if control.is_paused() {
            self.tracker.pause(progress);
            info!(transfer_id = %progress.transfer_id, "Transfer paused");
            on_progress(progress.clone());

            if !control.wait_while_paused().await {
                return false;
            }

            self.tracker.resume(progress);
            info!(transfer_id = %progress.transfer_id, "Transfer resumed");
            on_progress(progress.clone());
        }
        true
    }
}

/// Close a transfer as cancelled and build the error carrying its progress.
pub(crate) async fn finish_cancelled<C>(
    tracker: &ProgressTracker,
    activity: Option<&SharedActivityLogger>,
    transfer_metrics: &TransferMetrics,
    mut progress: TransferProgress,
    on_progress: &mut C,
) -> TransferError
where
    C: FnMut(TransferProgress),
{
    tracker.cancel(&mut progress);
    warn!("Transfer cancelled: {}", progress.format_progress());
    on_progress(progress.clone());
    record_best_effort(
        activity,
        ActivityEvent::for_progress(ActivityKind::TransferCancelled, "Transfer cancelled", &progress),
    )
    .await;
    transfer_metrics.record_aborted("cancelled", "cancellation requested");
    TransferError::Cancelled {
        progress: Box::new(progress),
    }
}

/// Close a transfer as completed, report and log it.
pub(crate) async fn finish_completed<C>(
    tracker: &ProgressTracker,
    activity: Option<&SharedActivityLogger>,
    transfer_metrics: &TransferMetrics,
    progress: &mut TransferProgress,
    on_progress: &mut C,
) where
    C: FnMut(TransferProgress),
{
    let already_completed = progress.status == TransferStatus::Completed;
    tracker.complete(progress);
    if !already_completed {
        on_progress(progress.clone());
    }

    info!(
        processed = progress.processed_records,
        failed = progress.failed_records,
        skipped = progress.skipped_records,
        elapsed_ms = progress.elapsed().as_millis(),
        "Transfer completed"
    );
    let description = if progress.failed_records == 0 {
        "Transfer completed".to_string()
    } else {
        format!(
            "Transfer completed with {} failed records",
            progress.failed_records
        )
    };
    record_best_effort(
        activity,
        ActivityEvent::for_progress(ActivityKind::TransferCompleted, description, progress),
    )
    .await;
    transfer_metrics.record_completed(progress.processed_records, progress.failed_records);
}

/// Batch transfer orchestrator for an in-memory collection
#[derive(Clone, Default)]
pub struct TransferOrchestrator {
    config: BatchConfig,
    tracker: ProgressTracker,
    activity: Option<SharedActivityLogger>,
    control: Option<SharedControl>,
}

impl std::fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("config", &self.config)
            .field("activity", &self.activity.is_some())
            .field("control", &self.control)
            .finish()
    }
}

impl TransferOrchestrator {
    /// Create an orchestrator
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Use a custom progress tracker
    pub fn with_tracker(mut self, tracker: ProgressTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Record start, milestone and completion events
    pub fn with_activity_logger(mut self, logger: SharedActivityLogger) -> Self {
        self.activity = Some(logger);
        self
    }

    /// Attach a control for cancellation and pause
    pub fn with_control(mut self, control: SharedControl) -> Self {
        self.control = Some(control);
        self
    }

    /// Batch configuration in use
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Transfer every item through `process`.
    ///
    /// `process` returns `Ok(true)` when a record was transferred, `Ok(false)`
    /// or [`ItemError::Rejected`] when the record failed, and
    /// [`ItemError::Systemic`] when the whole batch should be retried.
    /// `on_progress` receives a snapshot once before any batch runs and once
    /// after every batch. Passing `initial` continues a previous transfer:
    /// its counters carry over and the total becomes what it had already
    /// handled plus `items.len()`.
    ///
    /// Record failures never fail the call. Errors are returned only for
    /// invalid configuration and cancellation.
    pub async fn run<T, F, Fut, C>(
        &self,
        items: Vec<T>,
        process: F,
        mut on_progress: C,
        initial: Option<TransferProgress>,
    ) -> Result<TransferProgress, TransferError>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<bool, ItemError>>,
        C: FnMut(TransferProgress),
    {
        self.config.validate()?;

        let planner = BatchPlanner::from_config(&self.config);
        let total_batches = planner.batch_count(items.len());
        let progress = match initial {
            Some(previous) => continue_from(previous, items.len() as u64, total_batches),
            None => TransferProgress::new(items.len() as u64, total_batches),
        };

        let span = info_span!(
            "transfer",
            transfer_id = %progress.transfer_id,
            total_records = progress.total_records,
        );

        async move {
            let mut progress = progress;
            let activity = self.activity.as_ref();
            let transfer_metrics = TransferMetrics::start("batch");

            info!(
                batches = total_batches,
                batch_size = self.config.batch_size,
                concurrent_batches = self.config.concurrent_batches,
                "Starting batch transfer"
            );
            on_progress(progress.clone());
            record_best_effort(
                activity,
                ActivityEvent::for_progress(
                    ActivityKind::TransferStarted,
                    format!("Transfer of {} records started", progress.total_records),
                    &progress,
                ),
            )
            .await;

            if !items.is_empty() {
                self.tracker.start(&mut progress);
                let batches = planner.plan(items, 0);
                let mut driver = BatchDriver::new(
                    &self.config,
                    &self.tracker,
                    activity,
                    self.control.as_ref(),
                );

                if driver
                    .drive(batches, &process, &mut progress, &mut on_progress)
                    .await
                    == DriveResult::Cancelled
                {
                    return Err(finish_cancelled(
                        &self.tracker,
                        activity,
                        &transfer_metrics,
                        progress,
                        &mut on_progress,
                    )
                    .await);
                }
            }

            finish_completed(
                &self.tracker,
                activity,
                &transfer_metrics,
                &mut progress,
                &mut on_progress,
            )
            .await;
            Ok(progress)
        }
        .instrument(span)
        .await
    }
}

/// Carry the counters of a previous transfer into a new invocation.
fn continue_from(
    mut previous: TransferProgress,
    additional_records: u64,
    total_batches: usize,
) -> TransferProgress {
    previous.total_records = previous.handled_records() + additional_records;
    previous.total_batches = total_batches;
    previous.current_batch = 0;
    previous.estimated_time_remaining = None;
    previous.open_ended = false;
    previous.status = TransferStatus::Initializing;
    previous.percentage = if previous.total_records == 0 {
        0
    } else {
        (previous.processed_records * 100 / previous.total_records).min(100) as u8
    };
    previous
}
