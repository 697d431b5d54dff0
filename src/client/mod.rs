//! CRM REST API client
//!
//! Every request goes through an injected [`RateLimiter`](crate::transfer::RateLimiter),
//! so all clients sharing a limiter share one request budget.

pub mod http;

pub use http::ApiClient;

use crate::transfer::executor::ItemError;
use crate::transfer::rate_limit::{RateLimitError, RetryClassify};
use crate::transfer::retry::RetryErrorType;

/// API client errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Non-success HTTP status
    #[error("HTTP {status} from {endpoint}: {body}")]
    Status {
        /// Status code
        status: u16,
        /// Request path
        endpoint: String,
        /// Response body, truncated
        body: String,
    },

    /// Transport failure before a status was received
    #[error("network error on {endpoint}: {message}")]
    Network {
        /// Request path
        endpoint: String,
        /// Transport error description
        message: String,
        /// Classification of the transport failure
        kind: RetryErrorType,
    },

    /// Response body was not the expected JSON
    #[error("invalid response from {endpoint}: {message}")]
    Decode {
        /// Request path
        endpoint: String,
        /// Decoder error
        message: String,
    },

    /// Client could not be built
    #[error("client configuration error: {0}")]
    Config(String),
}

impl RetryClassify for ApiError {
    fn retry_type(&self) -> RetryErrorType {
        match self {
            Self::Status { status, .. } => reqwest::StatusCode::from_u16(*status)
                .map(RetryErrorType::from_status)
                .unwrap_or(RetryErrorType::NetworkGeneric),
            Self::Network { kind, .. } => *kind,
            Self::Decode { .. } | Self::Config(_) => RetryErrorType::InvalidResponse,
        }
    }
}

/// Record-level outcome of a failed request.
///
/// A request the CRM refused is a rejected record. Refused credentials, a
/// request that kept failing transiently, or a cancelled request are systemic
/// faults and let the batch executor retry the whole batch.
impl From<RateLimitError<ApiError>> for ItemError {
    fn from(err: RateLimitError<ApiError>) -> Self {
        match err {
            RateLimitError::Operation(e) => match e.retry_type() {
                RetryErrorType::AuthFailed(_) => ItemError::Systemic(e.to_string()),
                _ => ItemError::Rejected(e.to_string()),
            },
            RateLimitError::Exhausted {
                attempts,
                last_error,
            } => ItemError::Systemic(format!("{last_error} after {attempts} attempts")),
            RateLimitError::Cancelled => ItemError::Systemic("request cancelled".to_string()),
        }
    }
}
