//! Batch and streaming transfer engine
//!
//! This module moves records from a source to a caller-supplied per-record
//! processing function in bounded-concurrency batches, with retry, rate
//! limiting and live progress.
//!
//! # Overview
//!
//! 1. **Planning**: [`planner::BatchPlanner`] splits records into batches and
//!    groups batches into windows of `concurrent_batches * 2`
//! 2. **Execution**: [`executor::BatchExecutor`] processes every record of a
//!    batch concurrently and retries the whole batch on systemic faults
//! 3. **Progress**: [`progress::ProgressTracker`] folds each batch outcome into
//!    a [`progress::TransferProgress`] with a smoothed rate and ETA
//! 4. **Orchestration**: [`orchestrator::TransferOrchestrator`] for
//!    materialized collections, [`streaming::StreamingTransferOrchestrator`]
//!    for cursor-paginated sources
//! 5. **Rate limiting**: [`rate_limit::RateLimiter`] serializes outgoing calls
//!    of the API client layer
//!
//! # Quick Start
//!
//! ```no_run
//! use crm_transfer::transfer::{BatchConfig, ItemError, TransferOrchestrator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = TransferOrchestrator::new(BatchConfig::default());
//! let contacts: Vec<String> = vec!["ada@example.com".into(), "grace@example.com".into()];
//!
//! let progress = orchestrator
//!     .run(
//!         contacts,
//!         |email: String| async move { Ok::<_, ItemError>(!email.is_empty()) },
//!         |p| println!("{}", p.format_progress()),
//!         None,
//!     )
//!     .await?;
//! assert_eq!(progress.processed_records, 2);
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! Record and batch failures are recovered locally and only counted. Only
//! invalid configuration, an unreadable streaming source and cancellation
//! surface as [`TransferError`].

pub mod activity;
pub mod config;
pub mod dedup;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod streaming;

pub use activity::{ActivityEvent, ActivityKind, ActivityLogger, SharedActivityLogger};
pub use config::{BatchConfig, BatchPreset, ConfigError, StreamingConfig};
pub use executor::{BatchExecutor, BatchOutcome, ItemError};
pub use orchestrator::TransferOrchestrator;
pub use planner::{Batch, BatchPlanner};
pub use progress::{ProgressTracker, TransferOutcome, TransferProgress, TransferStatus};
pub use rate_limit::{RateLimitError, RateLimiter, RateLimiterConfig, RetryClassify};
pub use streaming::{CursorPage, StreamingTransferOrchestrator};

/// Transfer errors
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Invalid batch or streaming configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Cancelled through a transfer control
    #[error(
        "transfer cancelled after {handled} of {total} records",
        handled = .progress.handled_records(),
        total = .progress.total_records
    )]
    Cancelled {
        /// Progress at the moment of cancellation
        progress: Box<TransferProgress>,
    },

    /// The streaming source kept failing
    #[error("source fetch failed after {attempts} attempts: {message}")]
    SourceExhausted {
        /// Fetch attempts made for the failing page
        attempts: u32,
        /// Last fetch error
        message: String,
        /// Progress with terminal `failed` status
        progress: Box<TransferProgress>,
    },
}

impl TransferError {
    /// Progress snapshot carried by the error, if any.
    pub fn progress(&self) -> Option<&TransferProgress> {
        match self {
            Self::Config(_) => None,
            Self::Cancelled { progress } | Self::SourceExhausted { progress, .. } => {
                Some(progress)
            }
        }
    }
}
