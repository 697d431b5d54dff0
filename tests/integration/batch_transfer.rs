//! Integration tests for the batch transfer orchestrator

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crm_transfer::transfer::activity::{ActivityError, ActivityEvent, ActivityKind, ActivityLogger};
use crm_transfer::transfer::{
    BatchConfig, BatchPlanner, ItemError, TransferOrchestrator, TransferOutcome, TransferProgress,
    TransferStatus,
};

fn config(batch_size: usize, concurrent_batches: usize) -> BatchConfig {
    BatchConfig::default()
        .with_batch_size(batch_size)
        .with_concurrent_batches(concurrent_batches)
        .with_retry(3, Duration::from_millis(10))
        .with_group_pause(Duration::ZERO)
}

#[derive(Default)]
struct RecordingLog {
    events: Mutex<Vec<ActivityEvent>>,
}

impl RecordingLog {
    fn kinds(&self) -> Vec<ActivityKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }
}

#[async_trait::async_trait]
impl ActivityLogger for RecordingLog {
    async fn record(&self, event: ActivityEvent) -> Result<(), ActivityError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

// 237 records, batch size 50, two concurrent batches

#[tokio::test]
async fn test_237_records_in_five_batches() {
    let planner = BatchPlanner::new(50, 2);
    let sizes: Vec<usize> = planner
        .plan((0..237u32).collect(), 0)
        .iter()
        .map(|b| b.len())
        .collect();
    assert_eq!(sizes, vec![50, 50, 50, 50, 37]);

    let orchestrator = TransferOrchestrator::new(config(50, 2));
    let progress = orchestrator
        .run(
            (0..237u32).collect(),
            |_| async { Ok::<_, ItemError>(true) },
            |_| {},
            None,
        )
        .await
        .unwrap();

    assert_eq!(progress.total_batches, 5);
    assert_eq!(progress.processed_records, 237);
    assert_eq!(progress.failed_records, 0);
    assert_eq!(progress.percentage, 100);
    assert_eq!(progress.status, TransferStatus::Completed);
    assert_eq!(progress.outcome(), TransferOutcome::Succeeded);
}

#[tokio::test]
async fn test_every_record_rejected_still_completes() {
    let orchestrator = TransferOrchestrator::new(config(7, 3));
    let progress = orchestrator
        .run(
            (0..40u32).collect(),
            |_| async { Ok::<_, ItemError>(false) },
            |_| {},
            None,
        )
        .await
        .unwrap();

    assert_eq!(progress.failed_records, 40);
    assert_eq!(progress.processed_records, 0);
    assert_eq!(progress.status, TransferStatus::Completed);
    assert_eq!(progress.percentage, 0);
    assert_eq!(progress.outcome(), TransferOutcome::CompletedWithErrors);
    assert!(!progress.is_success());
}

#[tokio::test]
async fn test_empty_input_completes_immediately() {
    let orchestrator = TransferOrchestrator::new(config(50, 2));
    let mut snapshots: Vec<TransferProgress> = Vec::new();

    let progress = orchestrator
        .run(
            Vec::<u32>::new(),
            |_| async { Ok::<_, ItemError>(true) },
            |p| snapshots.push(p),
            None,
        )
        .await
        .unwrap();

    assert_eq!(progress.status, TransferStatus::Completed);
    assert_eq!(progress.percentage, 0);
    assert_eq!(progress.total_batches, 0);
    assert!(!snapshots.is_empty());
    assert_eq!(snapshots.last().unwrap().status, TransferStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_systemic_failure_consumes_retry_attempts_plus_one() {
    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator = TransferOrchestrator::new(config(1, 1));

    let progress = orchestrator
        .run(
            vec!["deal-1"],
            {
                let calls = calls.clone();
                move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<bool, _>(ItemError::Systemic("503 from target".to_string())) }
                }
            },
            |_| {},
            None,
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(progress.failed_records, 1);
    assert_eq!(progress.processed_records, 0);
    assert_eq!(progress.status, TransferStatus::Completed);
    assert_eq!(progress.last_error.as_deref(), Some("503 from target"));
}

#[tokio::test(start_paused = true)]
async fn test_one_exhausted_batch_does_not_stop_the_others() {
    let orchestrator = TransferOrchestrator::new(config(10, 2));
    let progress = orchestrator
        .run(
            (0..50u32).collect(),
            |n| async move {
                // Batch 2 (records 20..30) keeps failing systemically
                if (20..30).contains(&n) {
                    Err(ItemError::Systemic("lock timeout".to_string()))
                } else {
                    Ok(true)
                }
            },
            |_| {},
            None,
        )
        .await
        .unwrap();

    assert_eq!(progress.processed_records, 40);
    assert_eq!(progress.failed_records, 10);
    assert_eq!(progress.status, TransferStatus::Completed);
}

#[tokio::test]
async fn test_progress_invariants_in_every_snapshot() {
    let orchestrator = TransferOrchestrator::new(config(6, 2));
    let snapshots = Arc::new(Mutex::new(Vec::new()));

    orchestrator
        .run(
            (0..100u32).collect(),
            |n| async move {
                match n % 5 {
                    0 => Err(ItemError::Rejected(format!("record {n} missing email"))),
                    1 => Ok(false),
                    _ => Ok(true),
                }
            },
            {
                let snapshots = snapshots.clone();
                move |p: TransferProgress| snapshots.lock().unwrap().push(p)
            },
            None,
        )
        .await
        .unwrap();

    let snapshots = snapshots.lock().unwrap();
    // initial snapshot + one per batch
    assert_eq!(snapshots.len(), 1 + 17);
    for p in snapshots.iter() {
        assert!(p.percentage <= 100);
        assert!(p.handled_records() <= p.total_records);
    }
    let handled: Vec<u64> = snapshots.iter().map(|p| p.handled_records()).collect();
    assert!(handled.windows(2).all(|w| w[0] <= w[1]));

    let last = snapshots.last().unwrap();
    assert_eq!(last.processed_records, 60);
    assert_eq!(last.failed_records, 40);
    assert!(last.last_error.as_deref().unwrap().contains("missing email"));
}

#[tokio::test(start_paused = true)]
async fn test_groups_are_separated_by_pause() {
    let orchestrator = TransferOrchestrator::new(
        config(1, 2).with_group_pause(Duration::from_millis(100)),
    );
    let start = tokio::time::Instant::now();

    // 6 batches in groups of 2: three groups, two pauses
    orchestrator
        .run(
            (0..6u32).collect(),
            |_| async { Ok::<_, ItemError>(true) },
            |_| {},
            None,
        )
        .await
        .unwrap();

    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(start.elapsed() < Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_batches_are_bounded() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let orchestrator = TransferOrchestrator::new(config(4, 3));

    orchestrator
        .run(
            (0..60u32).collect(),
            {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                move |_| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, ItemError>(true)
                    }
                }
            },
            |_| {},
            None,
        )
        .await
        .unwrap();

    // 3 batches of 4 records at most
    assert_eq!(peak.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn test_activity_events_start_milestone_completion() {
    let log = Arc::new(RecordingLog::default());
    let orchestrator =
        TransferOrchestrator::new(config(2, 4)).with_activity_logger(log.clone());

    orchestrator
        .run(
            (0..45u32).collect(),
            |_| async { Ok::<_, ItemError>(true) },
            |_| {},
            None,
        )
        .await
        .unwrap();

    // 23 batches: milestones after batch 10 and 20
    assert_eq!(
        log.kinds(),
        vec![
            ActivityKind::TransferStarted,
            ActivityKind::TransferMilestone,
            ActivityKind::TransferMilestone,
            ActivityKind::TransferCompleted,
        ]
    );
}

#[tokio::test]
async fn test_resume_from_cancelled_progress() {
    let orchestrator = TransferOrchestrator::new(config(5, 1));
    let mut previous = TransferProgress::new(20, 4);
    previous.processed_records = 8;
    previous.failed_records = 2;
    previous.status = TransferStatus::Cancelled;

    let progress = orchestrator
        .run(
            (0..10u32).collect(),
            |_| async { Ok::<_, ItemError>(true) },
            |_| {},
            Some(previous.clone()),
        )
        .await
        .unwrap();

    assert_eq!(progress.transfer_id, previous.transfer_id);
    assert_eq!(progress.total_records, 20);
    assert_eq!(progress.processed_records, 18);
    assert_eq!(progress.failed_records, 2);
    assert_eq!(progress.status, TransferStatus::Completed);
    assert_eq!(progress.percentage, 90);
}
