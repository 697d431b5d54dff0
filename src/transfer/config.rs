//! Transfer configuration, presets and backoff calculation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Maximum number of history points kept for rate smoothing.
pub const PROGRESS_HISTORY_LEN: usize = 20;

/// Weight of the previous estimate when smoothing rate and ETA.
pub const SMOOTHING_PREVIOUS: f64 = 0.7;

/// Weight of the new sample when smoothing rate and ETA.
pub const SMOOTHING_SAMPLE: f64 = 0.3;

/// Approximate size of one record in bytes, used for the advisory data volume.
pub const ASSUMED_RECORD_SIZE: u64 = 1024;

/// A milestone activity event is recorded every this many batches.
pub const MILESTONE_BATCH_INTERVAL: usize = 10;

/// Cooperative pause between two concurrency groups.
pub const DEFAULT_GROUP_PAUSE: Duration = Duration::from_millis(100);

/// Item-level error messages kept per batch outcome.
pub const MAX_ERRORS_PER_BATCH: usize = 10;

/// Above this many estimated records, callers should prefer the streaming path.
pub const STREAMING_THRESHOLD: u64 = 10_000;

/// Default page size requested from a streaming source.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Fetch attempts on a streaming source before the transfer fails.
pub const DEFAULT_FETCH_RETRY_ATTEMPTS: u32 = 5;

/// Fixed delay between streaming fetch attempts.
pub const DEFAULT_FETCH_RETRY_DELAY: Duration = Duration::from_millis(2000);

/// Exponential backoff used for batch retries: `base * 2^attempt`.
///
/// `attempt` is the 0-based index of the attempt that just failed, so the
/// first retry waits exactly `base`.
pub fn batch_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor)
}

/// Errors raised by [`BatchConfig::validate`] and friends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Batch size of zero
    #[error("batch_size must be at least 1")]
    ZeroBatchSize,

    /// Concurrency of zero
    #[error("concurrent_batches must be at least 1")]
    ZeroConcurrency,

    /// Page size of zero
    #[error("page_size must be at least 1")]
    ZeroPageSize,

    /// Unknown preset name
    #[error("unknown preset '{0}', expected one of: simple, standard, complex")]
    UnknownPreset(String),
}

/// Named configuration presets for typical CRM object shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPreset {
    /// Flat records with few fields: small batches, high concurrency.
    Simple,
    /// Balanced default.
    #[default]
    Standard,
    /// Relationally heavy objects (deals with line items, companies with
    /// associations): large batches, few concurrent batches, patient retries.
    Complex,
}

impl BatchPreset {
    /// All presets, in display order.
    pub const ALL: [BatchPreset; 3] = [Self::Simple, Self::Standard, Self::Complex];

    /// Concrete configuration for this preset.
    pub fn config(self) -> BatchConfig {
        match self {
            Self::Simple => BatchConfig {
                batch_size: 25,
                concurrent_batches: 6,
                retry_attempts: 3,
                retry_delay: Duration::from_millis(500),
                group_pause: DEFAULT_GROUP_PAUSE,
            },
            Self::Standard => BatchConfig {
                batch_size: 50,
                concurrent_batches: 3,
                retry_attempts: 3,
                retry_delay: Duration::from_millis(1000),
                group_pause: DEFAULT_GROUP_PAUSE,
            },
            Self::Complex => BatchConfig {
                batch_size: 200,
                concurrent_batches: 2,
                retry_attempts: 2,
                retry_delay: Duration::from_millis(2000),
                group_pause: DEFAULT_GROUP_PAUSE,
            },
        }
    }

    /// Lowercase preset name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Standard => "standard",
            Self::Complex => "complex",
        }
    }
}

impl fmt::Display for BatchPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BatchPreset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "standard" => Ok(Self::Standard),
            "complex" => Ok(Self::Complex),
            _ => Err(ConfigError::UnknownPreset(s.to_string())),
        }
    }
}

/// Batch execution settings, immutable for the duration of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Records per batch.
    pub batch_size: usize,
    /// Maximum number of batches executing at the same time.
    pub concurrent_batches: usize,
    /// Extra attempts after the first one when a batch hits a systemic fault.
    pub retry_attempts: u32,
    /// Base backoff between batch attempts.
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Pause between concurrency groups.
    #[serde(with = "duration_ms", default = "default_group_pause")]
    pub group_pause: Duration,
}

fn default_group_pause() -> Duration {
    DEFAULT_GROUP_PAUSE
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchPreset::default().config()
    }
}

impl BatchConfig {
    /// Configuration for a named preset.
    pub fn preset(preset: BatchPreset) -> Self {
        preset.config()
    }

    /// Override the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Override the number of concurrent batches.
    pub fn with_concurrent_batches(mut self, concurrent_batches: usize) -> Self {
        self.concurrent_batches = concurrent_batches;
        self
    }

    /// Override retry attempts and base delay.
    pub fn with_retry(mut self, retry_attempts: u32, retry_delay: Duration) -> Self {
        self.retry_attempts = retry_attempts;
        self.retry_delay = retry_delay;
        self
    }

    /// Override the pause between concurrency groups.
    pub fn with_group_pause(mut self, group_pause: Duration) -> Self {
        self.group_pause = group_pause;
        self
    }

    /// Number of batches grouped into one execution window.
    pub fn window_size(&self) -> usize {
        self.concurrent_batches.saturating_mul(2)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.concurrent_batches == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}

/// Settings for cursor-based streaming transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Records requested per page.
    pub page_size: usize,
    /// Caller's estimate of the total record count, if any.
    pub estimated_total: Option<u64>,
    /// Fetch attempts per page before the transfer is marked failed.
    pub fetch_retry_attempts: u32,
    /// Fixed delay between fetch attempts.
    #[serde(with = "duration_ms")]
    pub fetch_retry_delay: Duration,
    /// Batch settings applied to every page.
    pub batch: BatchConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            estimated_total: None,
            fetch_retry_attempts: DEFAULT_FETCH_RETRY_ATTEMPTS,
            fetch_retry_delay: DEFAULT_FETCH_RETRY_DELAY,
            batch: BatchConfig::default(),
        }
    }
}

impl StreamingConfig {
    /// Streaming settings wrapping the given batch configuration.
    pub fn new(batch: BatchConfig) -> Self {
        Self {
            batch,
            ..Self::default()
        }
    }

    /// Override the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Seed the total record count.
    pub fn with_estimated_total(mut self, estimated_total: Option<u64>) -> Self {
        self.estimated_total = estimated_total;
        self
    }

    /// Override fetch retry cap and fixed delay.
    pub fn with_fetch_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.fetch_retry_attempts = attempts;
        self.fetch_retry_delay = delay;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        self.batch.validate()
    }
}

/// Whether a source of the given estimated size should be streamed instead
/// of materialized in memory.
pub fn prefers_streaming(estimated_records: u64) -> bool {
    estimated_records > STREAMING_THRESHOLD
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
