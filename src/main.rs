//! Main entry point for the crm-transfer CLI

use clap::Parser;
use crm_transfer::cli::{Cli, Commands};
use crm_transfer::control::TransferControl;
use crm_transfer::transfer::TransferOutcome;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Exit code when the transfer completed but some records failed
const EXIT_COMPLETED_WITH_ERRORS: i32 = 2;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crm_transfer=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    if let Some(addr) = cli.metrics_addr {
        if let Err(e) = crm_transfer::metrics::init_metrics(addr).await {
            error!("Failed to start metrics exporter: {}", e);
            std::process::exit(1);
        }
    }

    // Ctrl+C cancels the running transfer at the next batch group boundary
    let control = TransferControl::shared();
    tokio::spawn({
        let control = control.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl+C received - finishing in-flight batches and stopping...");
                control.cancel();
            }
        }
    });

    let result = match cli.command {
        Commands::Push(ref args) => args
            .execute(&cli, control.clone())
            .await
            .map(Some)
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Stream(ref args) => args
            .execute(&cli, control.clone())
            .await
            .map(Some)
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Presets(ref presets_cmd) => presets_cmd
            .execute()
            .map(|_| None)
            .map_err(|e| anyhow::anyhow!(e)),
    };

    match result {
        Ok(Some(progress)) if progress.outcome() == TransferOutcome::CompletedWithErrors => {
            warn!(
                failed = progress.failed_records,
                "Transfer completed with failed records"
            );
            std::process::exit(EXIT_COMPLETED_WITH_ERRORS);
        }
        Ok(_) => {}
        Err(e) => {
            error!("Command failed: {}", e);
            std::process::exit(1);
        }
    }
}
