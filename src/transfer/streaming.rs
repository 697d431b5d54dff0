//! Streaming transfers for cursor-paginated sources
//!
//! [`StreamingTransferOrchestrator`] pulls one page at a time from the
//! source, hands the page to the same window driver the batch orchestrator
//! uses and only then asks for the next page, so memory stays bounded by the
//! page size. The loop ends when a page comes back empty or without a next
//! cursor.
//!
//! Page fetches are retried with a fixed delay up to a cap; a source that
//! keeps failing ends the transfer as `failed`.

use crate::control::{sleep_unless_cancelled, SharedControl};
use crate::metrics::{self, TransferMetrics};
use crate::transfer::activity::{
    record_best_effort, ActivityEvent, ActivityKind, SharedActivityLogger,
};
use crate::transfer::config::StreamingConfig;
use crate::transfer::dedup::DuplicateFilter;
use crate::transfer::executor::ItemError;
use crate::transfer::orchestrator::{finish_cancelled, finish_completed, BatchDriver, DriveResult};
use crate::transfer::planner::BatchPlanner;
use crate::transfer::progress::{ProgressTracker, TransferProgress};
use crate::transfer::TransferError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// One page of a cursor-paginated source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPage<T> {
    /// Records of this page
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    /// Cursor of the next page, absent on the last page
    #[serde(default, rename = "nextCursor", alias = "next_cursor")]
    pub next_cursor: Option<String>,
}

impl<T> CursorPage<T> {
    /// Page with a follow-up cursor.
    pub fn new(data: Vec<T>, next_cursor: Option<String>) -> Self {
        Self { data, next_cursor }
    }

    /// Final page.
    pub fn last(data: Vec<T>) -> Self {
        Self::new(data, None)
    }
}

enum FetchFailure {
    Cancelled,
    Exhausted { attempts: u32, message: String },
}

/// Streaming transfer orchestrator
#[derive(Clone, Default)]
pub struct StreamingTransferOrchestrator {
    config: StreamingConfig,
    tracker: ProgressTracker,
    activity: Option<SharedActivityLogger>,
    control: Option<SharedControl>,
}

impl std::fmt::Debug for StreamingTransferOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingTransferOrchestrator")
            .field("config", &self.config)
            .field("activity", &self.activity.is_some())
            .field("control", &self.control)
            .finish()
    }
}

impl StreamingTransferOrchestrator {
    /// Create an orchestrator
    pub fn new(config: StreamingConfig) -> Self {
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

    /// Streaming configuration in use
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Stream every page of the source through `process`.
    ///
    /// `fetch` receives the cursor of the page to load (`None` for the first
    /// page) and the page size. Processing semantics match
    /// [`TransferOrchestrator::run`](crate::transfer::TransferOrchestrator::run).
    pub async fn run<T, Fetch, FetchFut, E, F, Fut, C>(
        &self,
        fetch: Fetch,
        process: F,
        on_progress: C,
    ) -> Result<TransferProgress, TransferError>
    where
        T: Clone,
        Fetch: Fn(Option<String>, usize) -> FetchFut,
        FetchFut: Future<Output = Result<CursorPage<T>, E>>,
        E: Display,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<bool, ItemError>>,
        C: FnMut(TransferProgress),
    {
        self.stream(fetch, process, on_progress, None::<fn(&T) -> Option<String>>)
            .await
    }

    /// [`run`](Self::run), skipping records whose `key` was already seen.
    ///
    /// Skipped records are counted in `skipped_records` and never processed.
    /// Records for which `key` returns `None` are always processed.
    pub async fn run_deduplicated<T, Fetch, FetchFut, E, F, Fut, C, K>(
        &self,
        fetch: Fetch,
        process: F,
        on_progress: C,
        key: K,
    ) -> Result<TransferProgress, TransferError>
    where
        T: Clone,
        Fetch: Fn(Option<String>, usize) -> FetchFut,
        FetchFut: Future<Output = Result<CursorPage<T>, E>>,
        E: Display,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<bool, ItemError>>,
        C: FnMut(TransferProgress),
        K: Fn(&T) -> Option<String>,
    {
        self.stream(fetch, process, on_progress, Some(key)).await
    }

    async fn stream<T, Fetch, FetchFut, E, F, Fut, C, K>(
        &self,
        fetch: Fetch,
        process: F,
        mut on_progress: C,
        key: Option<K>,
    ) -> Result<TransferProgress, TransferError>
    where
        T: Clone,
        Fetch: Fn(Option<String>, usize) -> FetchFut,
        FetchFut: Future<Output = Result<CursorPage<T>, E>>,
        E: Display,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<bool, ItemError>>,
        C: FnMut(TransferProgress),
        K: Fn(&T) -> Option<String>,
    {
        self.config.validate()?;

        let mut progress = TransferProgress::open_ended(self.config.estimated_total);
        let span = info_span!(
            "transfer",
            transfer_id = %progress.transfer_id,
            total_records = progress.total_records,
        );

        async move {
            let activity = self.activity.as_ref();
            let transfer_metrics = TransferMetrics::start("streaming");
            let planner = BatchPlanner::from_config(&self.config.batch);
            let mut filter = key
                .as_ref()
                .map(|_| DuplicateFilter::for_estimate(self.config.estimated_total));

            info!(
                page_size = self.config.page_size,
                estimated_total = self.config.estimated_total,
                deduplicate = filter.is_some(),
                "Starting streaming transfer"
            );
            on_progress(progress.clone());
            record_best_effort(
                activity,
                ActivityEvent::for_progress(
                    ActivityKind::TransferStarted,
                    "Streaming transfer started",
                    &progress,
                ),
            )
            .await;
            self.tracker.start(&mut progress);

            let mut driver = BatchDriver::new(
                &self.config.batch,
                &self.tracker,
                activity,
                self.control.as_ref(),
            );
            let mut cursor: Option<String> = None;
            let mut next_batch = 0usize;
            let mut pages = 0usize;

            loop {
                let page = match self.fetch_page(&fetch, cursor.clone()).await {
                    Ok(page) => page,
                    Err(FetchFailure::Cancelled) => {
                        return Err(finish_cancelled(
                            &self.tracker,
                            activity,
                            &transfer_metrics,
                            progress,
                            &mut on_progress,
                        )
                        .await);
                    }
                    Err(FetchFailure::Exhausted { attempts, message }) => {
                        self.tracker.fail(&mut progress, message.clone());
                        error!(
                            page = pages + 1,
                            attempts = attempts,
                            error = %message,
                            "Source fetch retries exhausted, failing transfer"
                        );
                        on_progress(progress.clone());
                        record_best_effort(
                            activity,
                            ActivityEvent::for_progress(
                                ActivityKind::TransferFailed,
                                format!("Source fetch failed after {attempts} attempts"),
                                &progress,
                            ),
                        )
                        .await;
                        transfer_metrics.record_aborted("failed", &message);
                        return Err(TransferError::SourceExhausted {
                            attempts,
                            message,
                            progress: Box::new(progress),
                        });
                    }
                };
                pages += 1;

                let CursorPage {
                    data: mut records,
                    next_cursor,
                } = page;
                if records.is_empty() {
                    debug!(page = pages, "Empty page, source exhausted");
                    break;
                }

                let fetched = records.len();
                if let (Some(filter), Some(key)) = (filter.as_mut(), key.as_ref()) {
                    let skipped = filter.retain_unseen(&mut records, key);
                    if skipped > 0 {
                        progress.skipped_records += skipped;
                        metrics::record_skipped(skipped);
                        debug!(page = pages, skipped = skipped, "Skipped duplicate records");
                    }
                }

                let expected = progress.handled_records() + records.len() as u64;
                if expected > progress.total_records {
                    progress.total_records = expected;
                }

                let batches = planner.plan(records, next_batch);
                next_batch += batches.len();
                progress.total_batches = next_batch;
                debug!(
                    page = pages,
                    fetched = fetched,
                    batches = batches.len(),
                    has_more = next_cursor.is_some(),
                    "Processing page"
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

                match next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }

            info!(pages = pages, "Source exhausted");
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

    /// Fetch one page with a fixed delay between attempts.
    async fn fetch_page<T, Fetch, FetchFut, E>(
        &self,
        fetch: &Fetch,
        cursor: Option<String>,
    ) -> Result<CursorPage<T>, FetchFailure>
    where
        Fetch: Fn(Option<String>, usize) -> FetchFut,
        FetchFut: Future<Output = Result<CursorPage<T>, E>>,
        E: Display,
    {
        let control = self.control.as_deref();
        let max_attempts = self.config.fetch_retry_attempts.max(1);
        let mut attempt = 1;

        loop {
            if control.is_some_and(|c| c.is_cancelled()) {
                return Err(FetchFailure::Cancelled);
            }

            match fetch(cursor.clone(), self.config.page_size).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt >= max_attempts => {
                    return Err(FetchFailure::Exhausted {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = self.config.fetch_retry_delay.as_millis(),
                        error = %e,
                        "Page fetch failed, retrying"
                    );
                    metrics::record_fetch_retry(attempt);
                    if !sleep_unless_cancelled(control, self.config.fetch_retry_delay).await {
                        return Err(FetchFailure::Cancelled);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
