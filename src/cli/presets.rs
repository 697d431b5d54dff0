//! CLI command for listing batch configuration presets

use crate::transfer::config::STREAMING_THRESHOLD;
use crate::transfer::BatchPreset;
use clap::Args;
use serde_json::json;

use super::CliError;

/// Presets subcommand
#[derive(Debug, Args)]
pub struct PresetsCommand {
    /// Only show this preset
    pub preset: Option<BatchPreset>,

    /// Output format
    #[arg(long, default_value = "human")]
    pub format: PresetsFormat,
}

/// Output format for the presets command
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PresetsFormat {
    /// Human-readable table
    Human,
    /// JSON array
    Json,
}

impl PresetsCommand {
    /// Execute the presets command
    pub fn execute(&self) -> Result<(), CliError> {
        let presets: Vec<BatchPreset> = match self.preset {
            Some(preset) => vec![preset],
            None => BatchPreset::ALL.to_vec(),
        };

        match self.format {
            PresetsFormat::Json => {
                let rows: Vec<_> = presets
                    .iter()
                    .map(|preset| json!({ "name": preset.name(), "config": preset.config() }))
                    .collect();
                println!("{}", serde_json::Value::Array(rows));
            }
            PresetsFormat::Human => {
                println!(
                    "{:<10} {:>10} {:>11} {:>8} {:>10}",
                    "PRESET", "BATCH SIZE", "CONCURRENCY", "RETRIES", "DELAY (ms)"
                );
                for preset in presets {
                    let config = preset.config();
                    println!(
                        "{:<10} {:>10} {:>11} {:>8} {:>10}",
                        preset.name(),
                        config.batch_size,
                        config.concurrent_batches,
                        config.retry_attempts,
                        config.retry_delay.as_millis()
                    );
                }
                println!(
                    "\nSources larger than {STREAMING_THRESHOLD} records should use the `stream` command."
                );
            }
        }

        Ok(())
    }
}
