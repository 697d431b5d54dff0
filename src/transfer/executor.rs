//! Batch execution with whole-batch retry.
//!
//! Every record of a batch is processed concurrently on the current task.
//! A record that fails ([`ItemError::Rejected`] or `Ok(false)`) counts as one
//! failure and never affects its siblings. A [`ItemError::Systemic`] fault is
//! treated as a transient failure of the whole batch: the batch is retried
//! from scratch with exponential backoff, and once retries are exhausted every
//! record of the batch is counted as failed so the transfer can move on.

use crate::control::{sleep_unless_cancelled, SharedControl};
use crate::metrics;
use crate::transfer::config::{batch_backoff, BatchConfig, MAX_ERRORS_PER_BATCH};
use crate::transfer::planner::Batch;
use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Failure reported by a per-record processing function.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    /// The record itself could not be transferred (validation, conflict, ...).
    #[error("record rejected: {0}")]
    Rejected(String),

    /// Something outside the record failed (connection lost, credentials refused, ...).
    #[error("systemic failure: {0}")]
    Systemic(String),
}

/// Result of executing one batch, reported to the progress tracker once.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    /// 0-based batch index
    pub index: usize,
    /// Records in the batch
    pub size: usize,
    /// Records processed successfully
    pub succeeded: u64,
    /// Records that failed
    pub failed: u64,
    /// Attempts made, including the first one
    pub attempts: u32,
    /// Wall time including retries and backoff
    pub elapsed: Duration,
    /// Up to ten error messages, in record order
    pub errors: Vec<String>,
    /// Retries were exhausted and every record was marked failed
    pub exhausted: bool,
    /// Cancelled during backoff; counts must not be applied
    pub interrupted: bool,
}

impl BatchOutcome {
    /// Most relevant error message of this batch.
    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }
}

/// Runs batches against a per-record processing function.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    retry_attempts: u32,
    retry_delay: Duration,
    control: Option<SharedControl>,
}

impl BatchExecutor {
    /// Executor retrying systemic faults `retry_attempts` times.
    pub fn new(retry_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            retry_attempts,
            retry_delay,
            control: None,
        }
    }

    /// Executor using the retry settings of a [`BatchConfig`].
    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_delay)
    }

    /// Attach a control so cancellation interrupts retry backoff.
    pub fn with_control(mut self, control: Option<SharedControl>) -> Self {
        self.control = control;
        self
    }

    /// Execute one batch to completion or retry exhaustion.
    pub async fn execute<T, F, Fut>(&self, batch: &Batch<T>, process: &F) -> BatchOutcome
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<bool, ItemError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let results = join_all(batch.items.iter().cloned().map(process)).await;

            let mut succeeded = 0u64;
            let mut failed = 0u64;
            let mut errors = Vec::new();
            let mut systemic = None;

            for result in results {
                match result {
                    Ok(true) => succeeded += 1,
                    Ok(false) => failed += 1,
                    Err(ItemError::Rejected(message)) => {
                        failed += 1;
                        if errors.len() < MAX_ERRORS_PER_BATCH {
                            errors.push(message);
                        }
                    }
                    Err(ItemError::Systemic(message)) => {
                        systemic.get_or_insert(message);
                    }
                }
            }

            let Some(fault) = systemic else {
                debug!(
                    batch_index = batch.index,
                    succeeded = succeeded,
                    failed = failed,
                    attempts = attempt + 1,
                    "Batch finished"
                );
                return BatchOutcome {
                    index: batch.index,
                    size: batch.len(),
                    succeeded,
                    failed,
                    attempts: attempt + 1,
                    elapsed: started.elapsed(),
                    errors,
                    exhausted: false,
                    interrupted: false,
                };
            };

            if attempt >= self.retry_attempts {
                error!(
                    batch_index = batch.index,
                    attempts = attempt + 1,
                    error = %fault,
                    "Batch retries exhausted, marking all records failed"
                );
                return BatchOutcome {
                    index: batch.index,
                    size: batch.len(),
                    succeeded: 0,
                    failed: batch.len() as u64,
                    attempts: attempt + 1,
                    elapsed: started.elapsed(),
                    errors: vec![fault],
                    exhausted: true,
                    interrupted: false,
                };
            }

            let backoff = batch_backoff(self.retry_delay, attempt);
            warn!(
                batch_index = batch.index,
                attempt = attempt + 1,
                max_attempts = self.retry_attempts + 1,
                backoff_ms = backoff.as_millis(),
                error = %fault,
                "Systemic batch failure, retrying after backoff"
            );
            metrics::record_batch_retry(attempt + 1, backoff);

            if !sleep_unless_cancelled(self.control.as_deref(), backoff).await {
                warn!(batch_index = batch.index, "Batch retry abandoned on cancellation");
                return BatchOutcome {
                    index: batch.index,
                    size: batch.len(),
                    succeeded: 0,
                    failed: 0,
                    attempts: attempt + 1,
                    elapsed: started.elapsed(),
                    errors: vec![fault],
                    exhausted: false,
                    interrupted: true,
                };
            }

            attempt += 1;
        }
    }
}
