//! Observability metrics for transfers
//!
//! Counters, gauges and histograms for batch execution, retries, record
//! outcomes and rate limiter health.
//!
//! ## Architecture
//!
//! - Uses the `metrics` crate facade, so recording is a no-op until a recorder is installed
//! - Prometheus exporter for a scrape endpoint, installed by the CLI on `--metrics-addr`
//! - Recording never fails and never blocks the transfer

use crate::transfer::executor::BatchOutcome;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Correlation ID generator for request tracing
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize metrics system with Prometheus exporter
///
/// Idempotent: calling it again after a successful initialization does nothing.
///
/// # Arguments
/// * `addr` - Socket address to bind the Prometheus scrape endpoint (e.g., "0.0.0.0:9090")
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "transfer_batches_total",
        Unit::Count,
        "Batches finished, labelled by result"
    );

    describe_counter!(
        "transfer_batch_retries_total",
        Unit::Count,
        "Whole-batch retries after a systemic fault"
    );

    describe_counter!(
        "transfer_records_total",
        Unit::Count,
        "Records handled, labelled by outcome"
    );

    describe_histogram!(
        "transfer_batch_duration_seconds",
        Unit::Seconds,
        "Wall time of a batch including retries"
    );

    describe_counter!(
        "transfer_fetch_retries_total",
        Unit::Count,
        "Streaming page fetch retries"
    );

    describe_counter!(
        "transfers_finished_total",
        Unit::Count,
        "Transfers that reached a terminal state, labelled by outcome"
    );

    describe_counter!(
        "http_requests_total",
        Unit::Count,
        "CRM API requests, labelled by method, endpoint and status"
    );

    describe_histogram!(
        "http_request_duration_seconds",
        Unit::Seconds,
        "CRM API request latency"
    );

    describe_gauge!(
        "rate_limiter_queue_depth",
        Unit::Count,
        "Operations waiting in the rate limiter queue"
    );

    describe_counter!(
        "rate_limiter_retries_total",
        Unit::Count,
        "Operations retried in place by the rate limiter"
    );

    describe_histogram!(
        "rate_limiter_queue_wait_seconds",
        Unit::Seconds,
        "Time an operation spent queued before dispatch"
    );

    *initialized = true;
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Check if metrics system is initialized
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Generate a new correlation ID for request tracing
pub fn generate_correlation_id() -> String {
    let id = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("req-{id:08x}")
}

/// Record a finished batch
pub fn record_batch(outcome: &BatchOutcome) {
    let result = if outcome.exhausted { "exhausted" } else { "ok" };
    counter!("transfer_batches_total", "result" => result).increment(1);
    counter!("transfer_records_total", "outcome" => "processed").increment(outcome.succeeded);
    counter!("transfer_records_total", "outcome" => "failed").increment(outcome.failed);
    histogram!("transfer_batch_duration_seconds").record(outcome.elapsed.as_secs_f64());
}

/// Record a whole-batch retry
pub fn record_batch_retry(attempt: u32, backoff: Duration) {
    counter!(
        "transfer_batch_retries_total",
        "attempt" => attempt.to_string(),
    )
    .increment(1);

    debug!(
        attempt = attempt,
        backoff_ms = backoff.as_millis(),
        "Batch retry recorded"
    );
}

/// Record a streaming fetch retry
pub fn record_fetch_retry(attempt: u32) {
    counter!(
        "transfer_fetch_retries_total",
        "attempt" => attempt.to_string(),
    )
    .increment(1);
}

/// Record records skipped as duplicates
pub fn record_skipped(count: u64) {
    counter!("transfer_records_total", "outcome" => "skipped").increment(count);
}

/// Timing and outcome of one CRM API request
///
/// Every request gets a correlation id that appears in its debug and warn
/// logs, so a throttled call can be matched with its retries.
pub struct HttpRequestMetrics {
    method: &'static str,
    endpoint: String,
    started: Instant,
    correlation_id: String,
}

impl HttpRequestMetrics {
    /// Start timing a request
    pub fn start(method: &'static str, endpoint: impl Into<String>) -> Self {
        let metrics = Self {
            method,
            endpoint: endpoint.into(),
            started: Instant::now(),
            correlation_id: generate_correlation_id(),
        };
        debug!(
            correlation_id = %metrics.correlation_id,
            method = method,
            endpoint = %metrics.endpoint,
            "Sending CRM request"
        );
        metrics
    }

    /// Record a response with `status_code`
    pub fn record_complete(&self, status_code: u16) {
        let elapsed = self.finish(status_code.to_string());

        match status_code {
            429 => warn!(
                correlation_id = %self.correlation_id,
                method = self.method,
                endpoint = %self.endpoint,
                elapsed_ms = elapsed.as_millis(),
                "CRM throttled request (429)"
            ),
            _ => debug!(
                correlation_id = %self.correlation_id,
                method = self.method,
                endpoint = %self.endpoint,
                status = status_code,
                elapsed_ms = elapsed.as_millis(),
                "CRM request finished"
            ),
        }
    }

    /// Record a transport failure, before any status was received
    pub fn record_network_error(&self) {
        let elapsed = self.finish("network_error".to_string());
        warn!(
            correlation_id = %self.correlation_id,
            method = self.method,
            endpoint = %self.endpoint,
            elapsed_ms = elapsed.as_millis(),
            "CRM request failed without a response"
        );
    }

    /// Correlation id of this request
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    fn finish(&self, status: String) -> Duration {
        let elapsed = self.started.elapsed();
        counter!(
            "http_requests_total",
            "method" => self.method,
            "endpoint" => self.endpoint.clone(),
            "status" => status,
        )
        .increment(1);
        histogram!(
            "http_request_duration_seconds",
            "method" => self.method,
            "endpoint" => self.endpoint.clone(),
        )
        .record(elapsed.as_secs_f64());
        elapsed
    }
}

/// Rate limiter queue metrics
pub struct RateLimiterMetrics;

impl RateLimiterMetrics {
    /// Update the queue depth gauge
    pub fn queue_depth(depth: usize) {
        gauge!("rate_limiter_queue_depth").set(depth as f64);
    }

    /// Record how long an operation waited before dispatch
    pub fn dispatched(waited: Duration) {
        histogram!("rate_limiter_queue_wait_seconds").record(waited.as_secs_f64());
        if waited.as_millis() > 1000 {
            debug!(
                wait_ms = waited.as_millis(),
                "Rate limited operation dispatched after long wait"
            );
        }
    }

    /// Record an in-place retry
    pub fn retried(attempt: u32, backoff: Duration) {
        counter!(
            "rate_limiter_retries_total",
            "attempt" => attempt.to_string(),
        )
        .increment(1);
        debug!(
            attempt = attempt,
            backoff_ms = backoff.as_millis(),
            "Rate limiter retry recorded"
        );
    }
}

/// Per-transfer metrics
pub struct TransferMetrics {
    kind: &'static str,
    start_time: Instant,
}

impl TransferMetrics {
    /// Start tracking a transfer
    pub fn start(kind: &'static str) -> Self {
        debug!(kind = kind, "Transfer metrics started");
        Self {
            kind,
            start_time: Instant::now(),
        }
    }

    /// Record a transfer that reached `completed`
    pub fn record_completed(&self, processed: u64, failed: u64) {
        let outcome = if failed == 0 { "succeeded" } else { "completed_with_errors" };
        counter!(
            "transfers_finished_total",
            "kind" => self.kind,
            "outcome" => outcome,
        )
        .increment(1);

        info!(
            kind = self.kind,
            processed = processed,
            failed = failed,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Transfer finished"
        );
    }

    /// Record a transfer that ended without completing
    pub fn record_aborted(&self, outcome: &'static str, reason: &str) {
        counter!(
            "transfers_finished_total",
            "kind" => self.kind,
            "outcome" => outcome,
        )
        .increment(1);

        error!(
            kind = self.kind,
            outcome = outcome,
            reason = %reason,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Transfer aborted"
        );
    }
}
