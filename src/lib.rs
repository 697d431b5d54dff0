//! # CRM Transfer Library
//!
//! A batch and streaming transfer engine for moving records between CRM
//! systems. Designed for bulk migrations where the target enforces request
//! quotas and a single bad record must never stop the run.
//!
//! ## Features
//!
//! - **Batch Planning**: Deterministic fixed-size batches grouped into concurrency windows
//! - **Batch Retry**: Whole-batch retry with exponential backoff on systemic failures
//! - **Progress Tracking**: Counters, smoothed processing rate, peak rate and ETA
//! - **Streaming**: Cursor-paginated sources processed page by page in bounded memory
//! - **Rate Limiting**: FIFO request spacing with in-place retry of 429/5xx responses
//! - **Cancellation**: Cooperative cancel and pause at batch group boundaries
//!
//! ## Quick Start
//!
//! ```no_run
//! use crm_transfer::client::ApiClient;
//! use crm_transfer::transfer::{BatchPreset, BatchConfig, ItemError, RateLimiter, TransferOrchestrator};
//! use serde_json::{json, Value};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ApiClient::new("https://crm.example.com", RateLimiter::per_second(10))?;
//! let contacts = vec![json!({"email": "ada@example.com"}), json!({"email": "grace@example.com"})];
//!
//! let orchestrator = TransferOrchestrator::new(BatchConfig::preset(BatchPreset::Simple));
//! let progress = orchestrator
//!     .run(
//!         contacts,
//!         |contact: Value| {
//!             let client = client.clone();
//!             async move {
//!                 client
//!                     .post_json::<Value, Value>("/contacts", &contact)
//!                     .await
//!                     .map(|_| true)
//!                     .map_err(ItemError::from)
//!             }
//!         },
//!         |p| println!("{}", p.format_progress()),
//!         None,
//!     )
//!     .await?;
//! println!("{} transferred, {} failed", progress.processed_records, progress.failed_records);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`transfer`] - Planning, batch execution, progress, orchestrators and the rate limiter
//! - [`client`] - Rate-limited JSON HTTP client for CRM REST APIs
//! - [`control`] - Cancellation and pause signal shared with running transfers
//! - [`metrics`] - Prometheus metrics for batches, records and the rate limiter
//! - [`cli`] - `push`, `stream` and `presets` commands

#![warn(missing_docs)]
#![warn(clippy::all)]

/// CLI command implementations
pub mod cli;

/// CRM REST API client
pub mod client;

/// Cancellation and pause coordination
pub mod control;

/// Observability metrics
pub mod metrics;

/// Transfer engine
pub mod transfer;

pub use control::{SharedControl, TransferControl};
pub use transfer::{
    BatchConfig, BatchPreset, ItemError, StreamingConfig, StreamingTransferOrchestrator,
    TransferError, TransferOrchestrator, TransferProgress, TransferStatus,
};
