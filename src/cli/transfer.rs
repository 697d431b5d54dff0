//! Push and stream command implementations

use crate::client::ApiClient;
use crate::control::SharedControl;
use crate::transfer::activity::{JsonLinesActivityLog, SharedActivityLogger, TracingActivityLog};
use crate::transfer::config::prefers_streaming;
use crate::transfer::rate_limit::{RateLimiter, RateLimiterConfig};
use crate::transfer::{
    BatchConfig, BatchPreset, ItemError, StreamingConfig, StreamingTransferOrchestrator,
    TransferError, TransferOrchestrator, TransferProgress,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{CliError, PresetsCommand};

/// Maximum allowed concurrent batches to prevent self-inflicted rate limiting
const MAX_CONCURRENT_BATCHES: usize = 32;

/// Parse and validate a concurrent batch count
fn parse_concurrent_batches(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrent batches must be at least 1".to_string());
    }
    if value > MAX_CONCURRENT_BATCHES {
        return Err(format!(
            "concurrent batches {value} exceeds maximum of {MAX_CONCURRENT_BATCHES}"
        ));
    }
    Ok(value)
}

/// Parse a strictly positive size
fn parse_positive(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("value must be at least 1".to_string()),
        Ok(value) => Ok(value),
        Err(_) => Err(format!("'{s}' is not a valid number")),
    }
}

/// CRM-to-CRM record transfer CLI
#[derive(Parser, Debug)]
#[command(name = "crm-transfer")]
#[command(about = "Transfer records between CRM systems in rate-limited batches", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Requests per second sent to each CRM
    #[arg(long, global = true, default_value = "10", value_parser = clap::value_parser!(u32).range(1..=100))]
    pub rps: u32,

    /// In-place retries of a rate limited, 5xx or network failure (range: 0-10)
    #[arg(long, global = true, default_value = "3", value_parser = clap::value_parser!(u32).range(0..=10))]
    pub request_retries: u32,

    /// Append activity events as JSON lines to this file instead of the log
    #[arg(long, global = true)]
    pub activity_log: Option<PathBuf>,

    /// Serve Prometheus metrics on this address (e.g., 127.0.0.1:9000)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Rate limiter for one CRM endpoint
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            requests_per_second: self.rps,
            max_retries: self.request_retries,
            ..RateLimiterConfig::default()
        })
    }

    /// Activity logger selected by `--activity-log`
    pub fn activity_logger(&self) -> SharedActivityLogger {
        match &self.activity_log {
            Some(path) => Arc::new(JsonLinesActivityLog::new(path.clone())),
            None => Arc::new(TracingActivityLog),
        }
    }
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Push records from a JSON lines file to a CRM endpoint
    Push(PushArgs),

    /// Stream records page by page from one CRM to another
    Stream(StreamArgs),

    /// List batch configuration presets
    Presets(PresetsCommand),
}

/// Batch execution flags shared by push and stream
#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// Configuration preset: simple, standard or complex
    #[arg(long, default_value = "standard")]
    pub preset: BatchPreset,

    /// Records per batch (overrides the preset)
    #[arg(long, value_parser = parse_positive)]
    pub batch_size: Option<usize>,

    /// Batches executing at the same time (overrides the preset, max: 32)
    #[arg(long, value_parser = parse_concurrent_batches)]
    pub concurrent_batches: Option<usize>,

    /// Whole-batch retries after a systemic failure (overrides the preset)
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// Base batch retry delay in milliseconds (overrides the preset)
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,
}

impl BatchArgs {
    /// Preset configuration with command line overrides applied
    pub fn config(&self) -> BatchConfig {
        let mut config = BatchConfig::preset(self.preset);
        if let Some(batch_size) = self.batch_size {
            config = config.with_batch_size(batch_size);
        }
        if let Some(concurrent_batches) = self.concurrent_batches {
            config = config.with_concurrent_batches(concurrent_batches);
        }
        let attempts = self.retry_attempts.unwrap_or(config.retry_attempts);
        let delay = self
            .retry_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(config.retry_delay);
        config.with_retry(attempts, delay)
    }
}

/// Target CRM flags
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Base URL of the target CRM API
    #[arg(long, env = "CRM_TARGET_URL")]
    pub target_url: String,

    /// Object path records are POSTed to (e.g., /crm/v3/objects/contacts)
    #[arg(long)]
    pub path: String,

    /// Bearer token for the target CRM
    #[arg(long, env = "CRM_TARGET_TOKEN", hide_env_values = true)]
    pub target_token: Option<String>,
}

impl TargetArgs {
    fn client(&self, limiter: RateLimiter) -> Result<ApiClient, CliError> {
        let client = ApiClient::new(self.target_url.clone(), limiter)?;
        Ok(match &self.target_token {
            Some(token) => client.with_bearer_token(token.clone()),
            None => client,
        })
    }
}

/// Push command arguments
#[derive(Args, Debug)]
pub struct PushArgs {
    /// Records to transfer: JSON lines, or a single JSON array
    #[arg(long)]
    pub input: PathBuf,

    /// Target CRM
    #[command(flatten)]
    pub target: TargetArgs,

    /// Batch execution
    #[command(flatten)]
    pub batch: BatchArgs,
}

impl PushArgs {
    /// Execute the push command
    pub async fn execute(
        &self,
        cli: &Cli,
        control: SharedControl,
    ) -> Result<TransferProgress, CliError> {
        let records = read_records(&self.input).await?;
        info!(
            input = %self.input.display(),
            records = records.len(),
            "Loaded records"
        );
        if prefers_streaming(records.len() as u64) {
            warn!(
                records = records.len(),
                "Large input held in memory; consider the `stream` command"
            );
        }

        let limiter = cli.rate_limiter();
        cancel_requests_on_cancel(&control, limiter.clone());
        let client = self.target.client(limiter)?;
        let path = self.target.path.clone();

        let orchestrator = TransferOrchestrator::new(self.batch.config())
            .with_activity_logger(cli.activity_logger())
            .with_control(control);

        let bar = progress_bar(cli.output_format, Some(records.len() as u64));
        let result = orchestrator
            .run(
                records,
                |record| push_record(&client, &path, record),
                |progress| update_bar(&bar, &progress),
                None,
            )
            .await;
        bar.finish_and_clear();

        report("Push", cli.output_format, result)
    }
}

/// Stream command arguments
#[derive(Args, Debug)]
pub struct StreamArgs {
    /// Base URL of the source CRM API
    #[arg(long, env = "CRM_SOURCE_URL")]
    pub source_url: String,

    /// Collection path returning `{data, nextCursor}` pages
    #[arg(long)]
    pub source_path: String,

    /// Bearer token for the source CRM
    #[arg(long, env = "CRM_SOURCE_TOKEN", hide_env_values = true)]
    pub source_token: Option<String>,

    /// Records requested per page
    #[arg(long, default_value = "500", value_parser = parse_positive)]
    pub page_size: usize,

    /// Expected record count, used for percentage and ETA
    #[arg(long)]
    pub estimated_total: Option<u64>,

    /// Skip records whose value of this field was already transferred
    #[arg(long)]
    pub dedup_field: Option<String>,

    /// Attempts per page fetch before the transfer fails
    #[arg(long, default_value = "5", value_parser = clap::value_parser!(u32).range(1..=20))]
    pub fetch_attempts: u32,

    /// Delay between page fetch attempts in milliseconds
    #[arg(long, default_value = "2000")]
    pub fetch_retry_delay_ms: u64,

    /// Target CRM
    #[command(flatten)]
    pub target: TargetArgs,

    /// Batch execution
    #[command(flatten)]
    pub batch: BatchArgs,
}

impl StreamArgs {
    /// Streaming configuration from the command line
    pub fn config(&self) -> StreamingConfig {
        StreamingConfig::new(self.batch.config())
            .with_page_size(self.page_size)
            .with_estimated_total(self.estimated_total)
            .with_fetch_retry(
                self.fetch_attempts,
                Duration::from_millis(self.fetch_retry_delay_ms),
            )
    }

    /// Execute the stream command
    pub async fn execute(
        &self,
        cli: &Cli,
        control: SharedControl,
    ) -> Result<TransferProgress, CliError> {
        let source_limiter = cli.rate_limiter();
        let target_limiter = cli.rate_limiter();
        cancel_requests_on_cancel(&control, source_limiter.clone());
        cancel_requests_on_cancel(&control, target_limiter.clone());

        let mut source = ApiClient::new(self.source_url.clone(), source_limiter)?;
        if let Some(token) = &self.source_token {
            source = source.with_bearer_token(token.clone());
        }
        let target = self.target.client(target_limiter)?;
        let source_path = self.source_path.clone();
        let target_path = self.target.path.clone();

        let orchestrator = StreamingTransferOrchestrator::new(self.config())
            .with_activity_logger(cli.activity_logger())
            .with_control(control);

        let bar = progress_bar(cli.output_format, self.estimated_total);
        let fetch = |cursor: Option<String>, limit: usize| {
            source.fetch_page::<Value>(&source_path, cursor, limit)
        };
        let process = |record: Value| push_record(&target, &target_path, record);
        let on_progress = |progress: TransferProgress| update_bar(&bar, &progress);

        let result = match &self.dedup_field {
            Some(field) => {
                orchestrator
                    .run_deduplicated(fetch, process, on_progress, |record: &Value| {
                        dedup_key(record, field)
                    })
                    .await
            }
            None => orchestrator.run(fetch, process, on_progress).await,
        };
        bar.finish_and_clear();

        report("Stream", cli.output_format, result)
    }
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// POST one record; refusals fail the record, refused credentials or transient exhaustion fail the batch
async fn push_record(client: &ApiClient, path: &str, record: Value) -> Result<bool, ItemError> {
    client
        .post_json::<Value, Value>(path, &record)
        .await
        .map(|_| true)
        .map_err(ItemError::from)
}

/// Identifier of a record for duplicate detection
fn dedup_key(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Read records from a JSON lines file or a JSON array file
pub async fn read_records(path: &Path) -> Result<Vec<Value>, CliError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_records(&content)
}

fn parse_records(content: &str) -> Result<Vec<Value>, CliError> {
    if content.trim_start().starts_with('[') {
        return serde_json::from_str(content)
            .map_err(|e| CliError::InvalidInput(format!("JSON array: {e}")));
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line)
                .map_err(|e| CliError::InvalidInput(format!("line {}: {e}", number + 1)))
        })
        .collect()
}

/// Drop queued requests as soon as the transfer is cancelled
fn cancel_requests_on_cancel(control: &SharedControl, limiter: RateLimiter) {
    let control = control.clone();
    tokio::spawn(async move {
        control.cancelled().await;
        let dropped = limiter.cancel_pending();
        if dropped > 0 {
            warn!(dropped = dropped, "Dropped queued requests on cancellation");
        }
    });
}

fn progress_bar(format: OutputFormat, total: Option<u64>) -> ProgressBar {
    if format == OutputFormat::Json {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(total.unwrap_or(0));
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) {msg}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}

fn update_bar(bar: &ProgressBar, progress: &TransferProgress) {
    bar.set_length(progress.total_records);
    bar.set_position(progress.handled_records());
    let mut message = format!("batch {}/{}", progress.current_batch, progress.total_batches);
    if progress.failed_records > 0 {
        message.push_str(&format!(", {} failed", progress.failed_records));
    }
    if progress.skipped_records > 0 {
        message.push_str(&format!(", {} skipped", progress.skipped_records));
    }
    bar.set_message(message);
}

/// Print the final summary and turn the transfer result into a CLI result
fn report(
    command: &str,
    format: OutputFormat,
    result: Result<TransferProgress, TransferError>,
) -> Result<TransferProgress, CliError> {
    let progress = match &result {
        Ok(progress) => Some(progress),
        Err(e) => e.progress(),
    };

    match format {
        OutputFormat::Json => {
            let output = json!({
                "success": progress.is_some_and(TransferProgress::is_success),
                "outcome": progress.map(TransferProgress::outcome),
                "progress": progress,
                "error": result.as_ref().err().map(ToString::to_string),
            });
            println!("{output}");
        }
        OutputFormat::Human => {
            if let Some(progress) = progress {
                println!("\n{command} {}", progress.status);
                println!("Transferred: {}", progress.processed_records);
                println!("Failed:      {}", progress.failed_records);
                if progress.skipped_records > 0 {
                    println!("Skipped:     {}", progress.skipped_records);
                }
                println!(
                    "Duration:    {:.1}s (peak {:.0} records/sec)",
                    progress.elapsed().as_secs_f64(),
                    progress.peak_processing_rate
                );
                if let Some(error) = &progress.last_error {
                    println!("Last error:  {error}");
                }
            }
            if let Err(e) = &result {
                eprintln!("\n{command} failed!");
                eprintln!("Error: {e}");
            }
        }
    }

    result.map_err(CliError::from)
}
