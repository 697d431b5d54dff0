//! Integration tests for the request-spacing rate limiter
//!
//! All timing tests run on Tokio's paused clock.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crm_transfer::transfer::retry::RetryErrorType;
use crm_transfer::transfer::{RateLimitError, RateLimiter, RateLimiterConfig, RetryClassify};
use futures::future::join_all;
use tokio::time::Instant;

#[derive(Debug)]
struct CrmFault(u16);

impl fmt::Display for CrmFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}", self.0)
    }
}

impl RetryClassify for CrmFault {
    fn retry_type(&self) -> RetryErrorType {
        match reqwest::StatusCode::from_u16(self.0) {
            Ok(status) => RetryErrorType::from_status(status),
            Err(_) => RetryErrorType::NetworkGeneric,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_five_operations_at_ten_per_second() {
    let limiter = RateLimiter::per_second(10);
    let start = Instant::now();

    let calls: Vec<_> = (0..5)
        .map(|i| limiter.enqueue(move || async move { Ok::<_, CrmFault>(i) }))
        .collect();
    let results: Vec<_> = join_all(calls).await.into_iter().map(Result::unwrap).collect();

    assert_eq!(results, vec![0, 1, 2, 3, 4]);
    assert!(start.elapsed() >= Duration::from_millis(400));
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_follows_call_order() {
    let limiter = RateLimiter::per_second(20);
    let order = Arc::new(Mutex::new(Vec::new()));

    let calls: Vec<_> = (0..6)
        .map(|i| {
            let order = order.clone();
            limiter.enqueue(move || {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push((i, Instant::now()));
                    Ok::<_, CrmFault>(())
                }
            })
        })
        .collect();
    // Await in reverse: queue order is fixed at call time
    for call in calls.into_iter().rev() {
        call.await.unwrap();
    }

    let order = order.lock().unwrap();
    let ids: Vec<_> = order.iter().map(|(i, _)| *i).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    for pair in order.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(50));
    }
}

#[tokio::test(start_paused = true)]
async fn test_clones_share_one_budget() {
    let limiter = RateLimiter::per_second(5);
    let source = limiter.clone();
    let target = limiter.clone();
    let start = Instant::now();

    let a = source.enqueue(|| async { Ok::<_, CrmFault>("source") });
    let b = target.enqueue(|| async { Ok::<_, CrmFault>("target") });
    let c = source.enqueue(|| async { Ok::<_, CrmFault>("source") });
    let (a, b, c) = tokio::join!(a, b, c);

    assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), ("source", "target", "source"));
    // two 200ms gaps
    assert!(start.elapsed() >= Duration::from_millis(400));
}

#[tokio::test(start_paused = true)]
async fn test_throttled_operation_holds_the_queue() {
    let limiter = RateLimiter::new(RateLimiterConfig {
        requests_per_second: 100,
        max_retries: 2,
        base_backoff: Duration::from_millis(100),
    });
    let attempts = Arc::new(Mutex::new(0u32));
    let finished = Arc::new(Mutex::new(Vec::new()));

    let throttled = {
        let attempts = attempts.clone();
        let finished = finished.clone();
        limiter.enqueue(move || {
            let attempts = attempts.clone();
            let finished = finished.clone();
            async move {
                let mut n = attempts.lock().unwrap();
                *n += 1;
                if *n < 3 {
                    Err(CrmFault(429))
                } else {
                    finished.lock().unwrap().push("throttled");
                    Ok(())
                }
            }
        })
    };
    let follower = {
        let finished = finished.clone();
        limiter.enqueue(move || {
            let finished = finished.clone();
            async move {
                finished.lock().unwrap().push("follower");
                Ok::<_, CrmFault>(())
            }
        })
    };

    let start = Instant::now();
    let (first, second) = tokio::join!(throttled, follower);
    first.unwrap();
    second.unwrap();

    assert_eq!(*attempts.lock().unwrap(), 3);
    assert_eq!(*finished.lock().unwrap(), vec!["throttled", "follower"]);
    // 100ms + 200ms of backoff before the follower may run
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_validation_error_is_not_retried() {
    let limiter = RateLimiter::per_second(10);
    let calls = Arc::new(Mutex::new(0u32));

    let result = {
        let calls = calls.clone();
        limiter
            .enqueue(move || {
                *calls.lock().unwrap() += 1;
                async { Err::<(), _>(CrmFault(422)) }
            })
            .await
    };

    assert!(matches!(result, Err(RateLimitError::Operation(CrmFault(422)))));
    assert_eq!(*calls.lock().unwrap(), 1);
}
