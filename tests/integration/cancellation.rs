//! Integration tests for cancellation and pause
//!
//! Verifies that a shared control stops or holds transfers at batch group
//! boundaries and that counters stay consistent when it does.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crm_transfer::control::TransferControl;
use crm_transfer::transfer::retry::RetryErrorType;
use crm_transfer::transfer::{
    BatchConfig, CursorPage, ItemError, RateLimitError, RateLimiter, RetryClassify,
    StreamingConfig, StreamingTransferOrchestrator, TransferError, TransferOrchestrator,
    TransferProgress, TransferStatus,
};

fn config() -> BatchConfig {
    BatchConfig::default()
        .with_batch_size(5)
        .with_concurrent_batches(1)
        .with_retry(2, Duration::from_millis(10))
        .with_group_pause(Duration::from_millis(100))
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_transfer_stops_at_group_boundary() {
    let control = TransferControl::shared();
    let processed = Arc::new(AtomicUsize::new(0));
    let orchestrator = TransferOrchestrator::new(config()).with_control(control.clone());

    let result = orchestrator
        .run(
            (0..50u32).collect(),
            {
                let control = control.clone();
                let processed = processed.clone();
                move |_| {
                    // Cancel while the third batch is running
                    if processed.fetch_add(1, Ordering::SeqCst) == 12 {
                        control.cancel();
                    }
                    async { Ok::<_, ItemError>(true) }
                }
            },
            |_| {},
            None,
        )
        .await;

    let progress = match result {
        Err(TransferError::Cancelled { progress }) => progress,
        other => panic!("expected cancellation, got {other:?}"),
    };
    assert_eq!(progress.status, TransferStatus::Cancelled);
    // The running batch finishes, nothing after it starts
    assert_eq!(progress.processed_records, 15);
    assert_eq!(processed.load(Ordering::SeqCst), 15);
    assert!(progress.percentage < 100);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_progress_can_be_resumed() {
    let control = TransferControl::shared();
    let items: Vec<u32> = (0..20).collect();
    let orchestrator = TransferOrchestrator::new(config()).with_control(control.clone());

    let first = orchestrator
        .run(
            items.clone(),
            {
                let control = control.clone();
                move |n| {
                    if n == 9 {
                        control.cancel();
                    }
                    async { Ok::<_, ItemError>(true) }
                }
            },
            |_| {},
            None,
        )
        .await
        .unwrap_err();
    let previous = first.progress().unwrap().clone();
    assert_eq!(previous.processed_records, 10);

    let remaining = items[previous.handled_records() as usize..].to_vec();
    let resumed = TransferOrchestrator::new(config())
        .run(
            remaining,
            |_| async { Ok::<_, ItemError>(true) },
            |_| {},
            Some(previous.clone()),
        )
        .await
        .unwrap();

    assert_eq!(resumed.transfer_id, previous.transfer_id);
    assert_eq!(resumed.processed_records, 20);
    assert_eq!(resumed.total_records, 20);
    assert_eq!(resumed.status, TransferStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_batch_backoff() {
    let control = TransferControl::shared();
    let orchestrator = TransferOrchestrator::new(
        config().with_retry(5, Duration::from_secs(60)),
    )
    .with_control(control.clone());

    let canceller = {
        let control = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            control.cancel();
        })
    };
    let start = tokio::time::Instant::now();

    let result = orchestrator
        .run(
            (0..5u32).collect(),
            |_| async { Err::<bool, _>(ItemError::Systemic("CRM unavailable".to_string())) },
            |_| {},
            None,
        )
        .await;
    canceller.await.unwrap();

    let progress = match result {
        Err(TransferError::Cancelled { progress }) => progress,
        other => panic!("expected cancellation, got {other:?}"),
    };
    // Interrupted batch is neither counted as processed nor failed
    assert_eq!(progress.handled_records(), 0);
    assert!(start.elapsed() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_transfer_until_resumed() {
    let control = TransferControl::shared();
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let orchestrator = TransferOrchestrator::new(config()).with_control(control.clone());

    let resumer = {
        let control = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            control.resume();
        })
    };
    let start = tokio::time::Instant::now();

    let progress = orchestrator
        .run(
            (0..10u32).collect(),
            {
                let control = control.clone();
                move |n| {
                    if n == 0 {
                        control.pause();
                    }
                    async { Ok::<_, ItemError>(true) }
                }
            },
            {
                let statuses = statuses.clone();
                move |p: TransferProgress| statuses.lock().unwrap().push(p.status)
            },
            None,
        )
        .await
        .unwrap();
    resumer.await.unwrap();

    assert_eq!(progress.processed_records, 10);
    assert_eq!(progress.status, TransferStatus::Completed);
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![
            TransferStatus::Initializing,
            TransferStatus::InProgress,
            TransferStatus::Paused,
            TransferStatus::InProgress,
            TransferStatus::Completed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_paused() {
    let control = TransferControl::shared();
    control.pause();
    let orchestrator = TransferOrchestrator::new(config()).with_control(control.clone());

    let canceller = {
        let control = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            control.cancel();
        })
    };

    let err = orchestrator
        .run(
            (0..10u32).collect(),
            |_| async { Ok::<_, ItemError>(true) },
            |_| {},
            None,
        )
        .await
        .unwrap_err();
    canceller.await.unwrap();

    let progress = err.progress().unwrap();
    assert_eq!(progress.status, TransferStatus::Cancelled);
    assert_eq!(progress.processed_records, 0);
}

#[tokio::test(start_paused = true)]
async fn test_streaming_cancel_between_pages() {
    let control = TransferControl::shared();
    let fetches = Arc::new(AtomicUsize::new(0));
    let orchestrator = StreamingTransferOrchestrator::new(
        StreamingConfig::new(config().with_group_pause(Duration::ZERO)).with_page_size(5),
    )
    .with_control(control.clone());

    let err = orchestrator
        .run(
            {
                let fetches = fetches.clone();
                let control = control.clone();
                move |_cursor: Option<String>, _limit| {
                    if fetches.fetch_add(1, Ordering::SeqCst) == 1 {
                        control.cancel();
                    }
                    async { Ok::<_, String>(CursorPage::new(vec![1u32; 5], Some("more".to_string()))) }
                }
            },
            |_| async { Ok::<_, ItemError>(true) },
            |_| {},
        )
        .await
        .unwrap_err();

    let progress = err.progress().unwrap();
    assert_eq!(progress.status, TransferStatus::Cancelled);
    assert_eq!(progress.processed_records, 5);
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[derive(Debug)]
struct Unavailable;

impl std::fmt::Display for Unavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "service unavailable")
    }
}

impl RetryClassify for Unavailable {
    fn retry_type(&self) -> RetryErrorType {
        RetryErrorType::ServerError(503)
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_pending_rejects_queued_requests() {
    let limiter = RateLimiter::per_second(1);

    let queued: Vec<_> = (0..4)
        .map(|_| limiter.enqueue(|| async { Err::<(), _>(Unavailable) }))
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let dropped = limiter.cancel_pending();
    assert_eq!(dropped, 3);
    assert_eq!(limiter.pending(), 0);

    for result in futures::future::join_all(queued).await {
        assert!(matches!(result, Err(RateLimitError::Cancelled)));
    }
}
