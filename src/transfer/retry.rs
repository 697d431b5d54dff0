//! Retry classification and retry message formatting.
//!
//! Remote CRM failures are classified once into a [`RetryErrorType`]; the
//! classification decides whether the rate limiter retries in place and what
//! the operator is told when retries run out.

use reqwest::{Error as ReqwestError, StatusCode};
use std::time::Duration;

/// Classification of remote errors for retry decisions and user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryErrorType {
    /// Request timed out
    NetworkTimeout,
    /// Connection refused, DNS failure, or other offline scenarios
    NetworkOffline,
    /// HTTP 429 rate limit exceeded
    RateLimit,
    /// HTTP 5xx server error
    ServerError(u16),
    /// HTTP 400 or 422, the payload was refused
    InvalidRequest,
    /// Authentication failures (401/403)
    AuthFailed(u16),
    /// Other client errors (4xx, except 429)
    ClientError(u16),
    /// The response body could not be decoded
    InvalidResponse,
    /// Generic fallback when no better classification fits
    NetworkGeneric,
}

impl RetryErrorType {
    /// Classify an HTTP status code.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400 | 422 => Self::InvalidRequest,
            401 | 403 => Self::AuthFailed(status.as_u16()),
            429 => Self::RateLimit,
            code if status.is_server_error() => Self::ServerError(code),
            code if status.is_client_error() => Self::ClientError(code),
            _ => Self::NetworkGeneric,
        }
    }

    /// Classify a transport-level reqwest error.
    pub fn from_transport(err: &ReqwestError) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status);
        }
        if err.is_timeout() {
            Self::NetworkTimeout
        } else if err.is_connect() {
            Self::NetworkOffline
        } else if err.is_decode() {
            Self::InvalidResponse
        } else {
            Self::NetworkGeneric
        }
    }

    /// User-friendly description string used inside retry log messages.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network timeout",
            Self::NetworkOffline => "connection failed",
            Self::RateLimit => "rate limit exceeded",
            Self::ServerError(code) => match code {
                500 => "internal server error",
                502 => "bad gateway",
                503 => "service unavailable",
                504 => "gateway timeout",
                _ => "server error",
            },
            Self::InvalidRequest => "record rejected",
            Self::AuthFailed(401) => "authentication failed (401)",
            Self::AuthFailed(403) => "permission denied (403)",
            Self::AuthFailed(_) => "authentication failed",
            Self::ClientError(404) => "resource not found",
            Self::ClientError(409) => "record conflict",
            Self::ClientError(_) => "client error",
            Self::InvalidResponse => "unreadable response",
            Self::NetworkGeneric => "network error",
        }
    }

    /// Suggested remediation presented after retries are exhausted.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "Check your network connection and firewall settings",
            Self::NetworkOffline => "Verify the CRM base URL and DNS resolution",
            Self::RateLimit => "Lower --rps or use a preset with fewer concurrent batches",
            Self::ServerError(_) => "The CRM may be experiencing issues, try again later",
            Self::InvalidRequest => "Check the record payload against the target object schema",
            Self::AuthFailed(_) => "Verify the access token and its scopes",
            Self::ClientError(_) => "Review the object path and request parameters",
            Self::InvalidResponse => "Check that the source path returns {data, nextCursor} pages",
            Self::NetworkGeneric => "Check network connectivity and try again",
        }
    }

    /// Whether the error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidRequest | Self::AuthFailed(_) | Self::ClientError(_) | Self::InvalidResponse
        )
    }
}

/// Context for formatting retry messages.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Current attempt number (1-based)
    pub attempt: u32,
    /// Maximum number of attempts configured
    pub max_attempts: u32,
    /// Type of error that triggered the retry
    pub error_type: RetryErrorType,
    /// Backoff until the next attempt
    pub backoff: Duration,
    /// Original error message
    pub error_message: String,
    /// URL or endpoint that failed
    pub endpoint: String,
}

impl RetryContext {
    /// Standardized retry line with attempt counters.
    pub fn format_retry(&self) -> String {
        format!(
            "Retrying (attempt {}/{}) after {} - waiting {:.1} seconds... ({})",
            self.attempt,
            self.max_attempts,
            self.error_type.description(),
            self.backoff.as_secs_f64(),
            self.endpoint
        )
    }

    /// Final failure summary with actionable suggestions.
    pub fn format_failure(&self) -> String {
        [
            format!("[FAILED] Request failed after {} attempts", self.max_attempts),
            format!("  Last error: {}", self.error_message),
            format!("  Endpoint: {}", self.endpoint),
            "  Suggestions:".to_string(),
            format!("    - {}", self.error_type.suggestion()),
        ]
        .join("\n")
    }
}
