//! Rate-limited JSON-over-HTTP client for CRM APIs
//!
//! Provides:
//! - JSON GET/POST with generic deserialization
//! - Cursor page fetching (`{data, nextCursor}`) for streaming sources
//! - Rate limiter integration with in-place retry of 429/5xx/transport errors
//! - Per-request metrics with correlation ids

use crate::client::ApiError;
use crate::metrics::HttpRequestMetrics;
use crate::transfer::rate_limit::{RateLimitError, RateLimiter};
use crate::transfer::retry::RetryErrorType;
use crate::transfer::streaming::CursorPage;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest response body kept in an error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Result of a rate limited API call
pub type ApiResult<T> = Result<T, RateLimitError<ApiError>>;

/// HTTP client for one CRM base URL
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    limiter: RateLimiter,
    bearer_token: Option<String>,
}

impl ApiClient {
    /// Create a client with its own connection pool
    ///
    /// # Arguments
    /// * `base_url` - Base URL for API endpoints (e.g., "https://api.hubapi.com")
    /// * `limiter` - Rate limiter, possibly shared with other clients
    pub fn new(base_url: impl Into<String>, limiter: RateLimiter) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Config(e.to_string()))?;
        Ok(Self::with_http_client(http, base_url, limiter))
    }

    /// Create a client on an existing reqwest client
    pub fn with_http_client(http: Client, base_url: impl Into<String>, limiter: RateLimiter) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limiter,
            bearer_token: None,
        }
    }

    /// Authenticate every request with a bearer token
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Base URL without trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Rate limiter used by this client
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Full URL for an endpoint path
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// GET `path` with query parameters and decode the JSON response
    pub async fn get_json<T>(&self, path: &str, query: Vec<(String, String)>) -> ApiResult<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        let endpoint = path.to_string();
        let url = self.url(path);

        self.limiter
            .enqueue_named(endpoint.clone(), move || {
                let request = client.authorize(client.http.get(&url).query(&query));
                execute(request, "GET", endpoint.clone())
            })
            .await
    }

    /// POST a JSON body to `path` and decode the JSON response
    ///
    /// An empty response body decodes as JSON `null`.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned + Send + 'static,
    {
        let payload = serde_json::to_vec(body).map_err(|e| {
            RateLimitError::Operation(ApiError::Decode {
                endpoint: path.to_string(),
                message: e.to_string(),
            })
        })?;
        let client = self.clone();
        let endpoint = path.to_string();
        let url = self.url(path);

        self.limiter
            .enqueue_named(endpoint.clone(), move || {
                let request = client.authorize(
                    client
                        .http
                        .post(&url)
                        .header(reqwest::header::CONTENT_TYPE, "application/json")
                        .body(payload.clone()),
                );
                execute(request, "POST", endpoint.clone())
            })
            .await
    }

    /// Fetch one page of a cursor-paginated collection
    ///
    /// Sends `limit` and, after the first page, `cursor` as query parameters.
    pub async fn fetch_page<T>(
        &self,
        path: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> ApiResult<CursorPage<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut query = vec![("limit".to_string(), limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor".to_string(), cursor));
        }
        debug!(path = path, limit = limit, "Fetching source page");
        self.get_json(path, query).await
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn execute<T: DeserializeOwned>(
    request: RequestBuilder,
    method: &'static str,
    endpoint: String,
) -> Result<T, ApiError> {
    let metrics = HttpRequestMetrics::start(method, endpoint.clone());

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            metrics.record_network_error();
            return Err(ApiError::Network {
                kind: RetryErrorType::from_transport(&e),
                message: e.to_string(),
                endpoint,
            });
        }
    };

    let status = response.status();
    metrics.record_complete(status.as_u16());

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            endpoint,
            body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        });
    }

    let bytes = response.bytes().await.map_err(|e| ApiError::Network {
        kind: RetryErrorType::from_transport(&e),
        message: e.to_string(),
        endpoint: endpoint.clone(),
    })?;
    let body: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };

    serde_json::from_slice(body).map_err(|e| ApiError::Decode {
        endpoint,
        message: e.to_string(),
    })
}
