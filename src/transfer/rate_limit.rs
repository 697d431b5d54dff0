//! Request-spacing rate limiter with in-place retry
//!
//! Every outgoing CRM call is funnelled through one FIFO queue drained by a
//! single background task. Dispatch starts are spaced by at least
//! `1000 / requests_per_second` milliseconds, so at most one operation starts
//! per interval regardless of how many callers enqueue concurrently.
//!
//! A retryable failure (429, 5xx, transport error) is retried in place with
//! exponential backoff (`base_backoff * 2^retry`) before the queue advances;
//! retries never go back to the end of the queue.

use crate::metrics::RateLimiterMetrics;
use crate::transfer::retry::{RetryContext, RetryErrorType};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

/// Errors that can tell whether they are worth retrying.
pub trait RetryClassify {
    /// Classification of this error.
    fn retry_type(&self) -> RetryErrorType;

    /// Whether the limiter should retry the operation in place.
    fn is_retryable(&self) -> bool {
        self.retry_type().is_retryable()
    }
}

/// Rate limiter settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Dispatch starts per second
    pub requests_per_second: u32,
    /// In-place retries of a retryable failure
    pub max_retries: u32,
    /// Backoff before the first retry, doubled for each further retry
    pub base_backoff: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    /// Settings for `requests_per_second` with default retry behaviour.
    pub fn per_second(requests_per_second: u32) -> Self {
        Self {
            requests_per_second,
            ..Self::default()
        }
    }

    /// Minimum spacing between two dispatch starts.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.requests_per_second.max(1)))
    }

    /// Backoff before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Rate limited operation errors
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError<E> {
    /// Dropped from the queue by [`RateLimiter::cancel_pending`]
    #[error("rate limited operation cancelled before completion")]
    Cancelled,

    /// Still failing after every in-place retry
    #[error("operation failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made, including the first one
        attempts: u32,
        /// Error of the final attempt
        last_error: E,
    },

    /// Non-retryable failure, returned as-is
    #[error("{0}")]
    Operation(E),
}

impl<E> RateLimitError<E> {
    /// Underlying operation error, if there is one.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::Operation(e) => Some(e),
        }
    }
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Queued {
    job: Job,
    enqueued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Queued>,
    drain: Option<JoinHandle<()>>,
    last_dispatch: Option<Instant>,
}

struct Shared {
    config: RateLimiterConfig,
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO request-spacing rate limiter.
///
/// Cloning is cheap; clones share one queue, so a limiter handed to several
/// API clients caps their combined request rate.
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.shared.config)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl RateLimiter {
    /// Create a limiter
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Create a limiter for `requests_per_second` with default retries
    pub fn per_second(requests_per_second: u32) -> Self {
        Self::new(RateLimiterConfig::per_second(requests_per_second))
    }

    /// Limiter settings
    pub fn config(&self) -> &RateLimiterConfig {
        &self.shared.config
    }

    /// Operations waiting for dispatch
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Queue `operation` and wait for its result.
    ///
    /// The operation is queued when this method is called, not when the
    /// returned future is first polled, so FIFO order follows call order.
    /// Must be called from within a Tokio runtime.
    pub fn enqueue<T, E, F, Fut>(
        &self,
        operation: F,
    ) -> impl Future<Output = Result<T, RateLimitError<E>>> + Send + 'static
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: RetryClassify + fmt::Display + Send + 'static,
    {
        self.enqueue_named("operation", operation)
    }

    /// [`enqueue`](Self::enqueue) with an endpoint label for retry logs.
    pub fn enqueue_named<T, E, F, Fut>(
        &self,
        endpoint: impl Into<String>,
        operation: F,
    ) -> impl Future<Output = Result<T, RateLimitError<E>>> + Send + 'static
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: RetryClassify + fmt::Display + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let config = self.shared.config;
        let endpoint = endpoint.into();

        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = run_with_retry(operation, config, endpoint).await;
                let _ = tx.send(result);
            })
        });
        self.push(job);

        async move { rx.await.unwrap_or(Err(RateLimitError::Cancelled)) }
    }

    /// Drop every queued operation and stop the drain task.
    ///
    /// Callers of dropped operations, and of an operation interrupted while
    /// in flight, receive [`RateLimitError::Cancelled`]. Results that were
    /// already delivered are unaffected. Returns the number of queued
    /// operations dropped.
    pub fn cancel_pending(&self) -> usize {
        let mut state = self.shared.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        if let Some(drain) = state.drain.take() {
            drain.abort();
        }
        RateLimiterMetrics::queue_depth(0);
        if dropped > 0 {
            debug!(dropped = dropped, "Cancelled pending rate limited operations");
        }
        dropped
    }

    fn push(&self, job: Job) {
        let mut state = self.shared.lock();
        state.queue.push_back(Queued {
            job,
            enqueued_at: Instant::now(),
        });
        RateLimiterMetrics::queue_depth(state.queue.len());

        if state.drain.is_none() {
            let shared = self.shared.clone();
            state.drain = Some(tokio::spawn(drain(shared)));
        }
    }
}

async fn drain(shared: Arc<Shared>) {
    let interval = shared.config.interval();

    loop {
        let (next, last_dispatch) = {
            let mut state = shared.lock();
            match state.queue.pop_front() {
                Some(next) => {
                    RateLimiterMetrics::queue_depth(state.queue.len());
                    (next, state.last_dispatch)
                }
                None => {
                    state.drain = None;
                    return;
                }
            }
        };

        if let Some(last) = last_dispatch {
            sleep_until(last + interval).await;
        }

        shared.lock().last_dispatch = Some(Instant::now());
        RateLimiterMetrics::dispatched(next.enqueued_at.elapsed());
        (next.job)().await;
    }
}

async fn run_with_retry<T, E, F, Fut>(
    mut operation: F,
    config: RateLimiterConfig,
    endpoint: String,
) -> Result<T, RateLimitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClassify + fmt::Display,
{
    let mut retry: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                let context = RetryContext {
                    attempt: retry + 1,
                    max_attempts: config.max_retries + 1,
                    error_type: e.retry_type(),
                    backoff: config.backoff(retry),
                    error_message: e.to_string(),
                    endpoint: endpoint.clone(),
                };

                if retry >= config.max_retries {
                    warn!("{}", context.format_failure());
                    return Err(RateLimitError::Exhausted {
                        attempts: retry + 1,
                        last_error: e,
                    });
                }

                warn!("{}", context.format_retry());
                RateLimiterMetrics::retried(retry + 1, context.backoff);
                sleep(context.backoff).await;
                retry += 1;
            }
            Err(e) => return Err(RateLimitError::Operation(e)),
        }
    }
}
