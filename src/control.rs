//! Cooperative cancellation and pause coordination for running transfers.
//!
//! A [`TransferControl`] is shared between the code driving a transfer and
//! whoever wants to steer it (a Ctrl+C handler, a UI "pause" button, a
//! teardown path). Orchestrators check it between batch groups and between
//! pages; retry backoff sleeps are interrupted by cancellation. Item futures
//! that were already dispatched are never aborted mid-flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Shared handle to a transfer control.
pub type SharedControl = Arc<TransferControl>;

/// Cancellation and pause signal for one or more transfers.
#[derive(Debug, Default)]
pub struct TransferControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
    notify: Notify,
}

impl TransferControl {
    /// Create a new control in the running state.
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Create a new shared control wrapped in [`Arc`].
    pub fn shared() -> SharedControl {
        Arc::new(Self::new())
    }

    /// Request cancellation. Wakes every waiter exactly once; further calls are no-ops.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Ask running transfers to pause at their next group boundary.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Let paused transfers continue.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Whether a pause is currently requested.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is requested. Returns immediately if already set.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel() is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Wait while paused. Returns `true` once resumed, `false` if cancelled instead.
    pub async fn wait_while_paused(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            notified.await;
        }
    }
}

/// Sleep for `delay`, waking early if `control` is cancelled.
///
/// Returns `true` when the full delay elapsed, `false` on cancellation.
pub async fn sleep_unless_cancelled(control: Option<&TransferControl>, delay: Duration) -> bool {
    match control {
        Some(control) => {
            if control.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = control.cancelled() => false,
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}
