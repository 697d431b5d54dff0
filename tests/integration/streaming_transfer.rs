//! Integration tests for cursor-paginated streaming transfers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crm_transfer::transfer::{
    BatchConfig, CursorPage, ItemError, StreamingConfig, StreamingTransferOrchestrator,
    TransferError, TransferProgress, TransferStatus,
};

fn streaming_config(page_size: usize) -> StreamingConfig {
    StreamingConfig::new(
        BatchConfig::default()
            .with_batch_size(4)
            .with_concurrent_batches(2)
            .with_retry(1, Duration::from_millis(10))
            .with_group_pause(Duration::ZERO),
    )
    .with_page_size(page_size)
    .with_fetch_retry(3, Duration::from_millis(50))
}

/// Source serving `pages` pages of `per_page` numbered records.
fn paged_source(
    pages: usize,
    per_page: usize,
    calls: Arc<AtomicUsize>,
) -> impl Fn(Option<String>, usize) -> std::future::Ready<Result<CursorPage<u32>, String>> {
    move |cursor, _limit| {
        calls.fetch_add(1, Ordering::SeqCst);
        let page: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let start = (page * per_page) as u32;
        let data = (start..start + per_page as u32).collect();
        let next = (page + 1 < pages).then(|| (page + 1).to_string());
        std::future::ready(Ok(CursorPage::new(data, next)))
    }
}

#[tokio::test]
async fn test_three_pages_then_null_cursor() {
    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator = StreamingTransferOrchestrator::new(streaming_config(10));

    let progress = orchestrator
        .run(
            paged_source(3, 10, calls.clone()),
            |_| async { Ok::<_, ItemError>(true) },
            |_| {},
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(progress.processed_records, 30);
    assert_eq!(progress.total_records, 30);
    assert_eq!(progress.percentage, 100);
    assert_eq!(progress.status, TransferStatus::Completed);
    // 3 pages of 10 in batches of 4: 3 batches per page
    assert_eq!(progress.total_batches, 9);
}

#[tokio::test]
async fn test_page_size_is_passed_to_source() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let orchestrator = StreamingTransferOrchestrator::new(streaming_config(250));

    orchestrator
        .run(
            {
                let seen = seen.clone();
                move |cursor: Option<String>, limit: usize| {
                    seen.lock().unwrap().push((cursor.clone(), limit));
                    let next = cursor.is_none().then(|| "after-first".to_string());
                    async move { Ok::<_, String>(CursorPage::new(vec![1u32, 2, 3], next)) }
                }
            },
            |_| async { Ok::<_, ItemError>(true) },
            |_| {},
        )
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![(None, 250), (Some("after-first".to_string()), 250)]
    );
}

#[tokio::test]
async fn test_estimated_total_grows_when_exceeded() {
    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator =
        StreamingTransferOrchestrator::new(streaming_config(10).with_estimated_total(Some(15)));
    let snapshots = Arc::new(Mutex::new(Vec::<TransferProgress>::new()));

    let progress = orchestrator
        .run(
            paged_source(3, 10, calls),
            |_| async { Ok::<_, ItemError>(true) },
            {
                let snapshots = snapshots.clone();
                move |p| snapshots.lock().unwrap().push(p)
            },
        )
        .await
        .unwrap();

    assert_eq!(progress.total_records, 30);
    assert_eq!(progress.status, TransferStatus::Completed);

    let snapshots = snapshots.lock().unwrap();
    assert_eq!(snapshots.first().unwrap().total_records, 15);
    for p in snapshots.iter() {
        assert!(p.percentage <= 100);
        assert!(p.handled_records() <= p.total_records);
    }
}

#[tokio::test]
async fn test_duplicates_across_pages_are_skipped() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let orchestrator = StreamingTransferOrchestrator::new(streaming_config(5));

    let progress = orchestrator
        .run_deduplicated(
            |cursor: Option<String>, _limit| async move {
                let page = match cursor.as_deref() {
                    None => CursorPage::new(vec!["a", "b", "c"], Some("p2".to_string())),
                    // Overlapping page boundary returns "c" again
                    Some("p2") => CursorPage::new(vec!["c", "d", ""], Some("p3".to_string())),
                    _ => CursorPage::last(vec!["a", "e", ""]),
                };
                Ok::<_, String>(page)
            },
            {
                let processed = processed.clone();
                move |record: &'static str| {
                    processed.lock().unwrap().push(record);
                    async { Ok::<_, ItemError>(true) }
                }
            },
            |_| {},
            |record: &&'static str| (!record.is_empty()).then(|| record.to_string()),
        )
        .await
        .unwrap();

    assert_eq!(progress.skipped_records, 2);
    // Records without a key are never deduplicated
    assert_eq!(progress.processed_records, 7);
    let mut processed = processed.lock().unwrap().clone();
    processed.sort_unstable();
    assert_eq!(processed, vec!["", "", "a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn test_dedup_keeps_unique_records_beyond_estimate() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = StreamingConfig::new(
        BatchConfig::default()
            .with_batch_size(100)
            .with_concurrent_batches(10)
            .with_group_pause(Duration::ZERO),
    )
    .with_page_size(1000)
    .with_estimated_total(Some(100));

    let progress = StreamingTransferOrchestrator::new(config)
        .run_deduplicated(
            paged_source(20, 1000, calls.clone()),
            |_| async { Ok::<_, ItemError>(true) },
            |_| {},
            |n: &u32| Some(format!("contact-{n}")),
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 20);
    assert_eq!(progress.skipped_records, 0);
    assert_eq!(progress.processed_records, 20_000);
    assert_eq!(progress.total_records, 20_000);
    assert_eq!(progress.status, TransferStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_transient_fetch_failure_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator = StreamingTransferOrchestrator::new(streaming_config(10));

    let progress = orchestrator
        .run(
            {
                let calls = calls.clone();
                move |_cursor: Option<String>, _limit| {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if call == 0 {
                            Err("connection reset by peer".to_string())
                        } else {
                            Ok(CursorPage::last(vec![1u32, 2, 3]))
                        }
                    }
                }
            },
            |_| async { Ok::<_, ItemError>(true) },
            |_| {},
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(progress.processed_records, 3);
    assert_eq!(progress.status, TransferStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_failure_after_first_page_keeps_counts() {
    let orchestrator = StreamingTransferOrchestrator::new(streaming_config(10));
    let last_status = Arc::new(Mutex::new(None));

    let err = orchestrator
        .run(
            |cursor: Option<String>, _limit| async move {
                match cursor {
                    None => Ok(CursorPage::new(vec![1u32; 10], Some("next".to_string()))),
                    Some(_) => Err("HTTP 503 from source"),
                }
            },
            |_| async { Ok::<_, ItemError>(true) },
            {
                let last_status = last_status.clone();
                move |p: TransferProgress| *last_status.lock().unwrap() = Some(p.status)
            },
        )
        .await
        .unwrap_err();

    match err {
        TransferError::SourceExhausted {
            attempts, progress, ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(progress.processed_records, 10);
            assert_eq!(progress.status, TransferStatus::Failed);
            assert_eq!(progress.last_error.as_deref(), Some("HTTP 503 from source"));
        }
        other => panic!("expected SourceExhausted, got {other:?}"),
    }
    assert_eq!(*last_status.lock().unwrap(), Some(TransferStatus::Failed));
}
