//! CLI error types and conversions

use crate::client::ApiError;
use crate::transfer::TransferError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Transfer error
    #[error("transfer error: {0}")]
    TransferError(#[from] TransferError),

    /// API client error
    #[error("API error: {0}")]
    ApiError(#[from] ApiError),

    /// Input file could not be read
    #[error("input error: {0}")]
    IoError(#[from] std::io::Error),

    /// Input file content is not valid JSON records
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
