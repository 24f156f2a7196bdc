//! Retry and circuit-breaker behaviour as seen by callers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vaultsync_core::{
    with_resilience, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryOptions,
    RetryPolicy, SyncError,
};

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(RetryOptions {
        max_attempts,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        exponential_base: 2.0,
        jitter: false,
    })
    .unwrap()
}

fn breaker(threshold: u32, recovery: Duration, probes: u32) -> CircuitBreaker {
    CircuitBreaker::new(
        "git",
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_time: recovery,
            half_open_max_calls: probes,
            monitoring_window: Duration::from_secs(120),
        },
    )
    .unwrap()
}

fn lock_contention() -> SyncError {
    SyncError::vcs("add", "fatal: Unable to create '.git/index.lock': File exists.")
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn always_failing_operation_runs_exactly_max_attempts() {
    let policy = fast_retry(3);
    let calls = Arc::new(AtomicU32::new(0));

    let err = policy
        .execute_with_retry("git.add", || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<(), _>(SyncError::vcs("add", format!("connection reset #{n}")))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match err {
        SyncError::RetryExhausted {
            context,
            attempts,
            last,
        } => {
            assert_eq!(context, "git.add");
            assert_eq!(attempts, 3);
            assert!(last.to_string().contains("connection reset #3"));
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn backoff_waits_between_attempts() {
    let policy = fast_retry(3);
    let started = tokio::time::Instant::now();

    let _ = policy
        .execute_with_retry("git.push", || async {
            Err::<(), _>(SyncError::vcs("push", "connection refused"))
        })
        .await;

    // 100ms after the first failure, 200ms after the second.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(299), "waited {waited:?}");
    assert!(waited < Duration::from_millis(310), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn custom_predicate_stops_on_permanent_errors() {
    let policy = fast_retry(5);
    let calls = Arc::new(AtomicU32::new(0));

    let err = policy
        .execute_with_custom_retry(
            "git.commit",
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SyncError::vcs("commit", "nothing to commit"))
                }
            },
            |err, _| err.is_transient(),
        )
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err, SyncError::Vcs { op: "commit", .. }));
    assert_eq!(policy.stats().failed_executions, 1);
}

#[tokio::test(start_paused = true)]
async fn recovers_after_transient_failures() {
    let policy = fast_retry(4);
    let calls = Arc::new(AtomicU32::new(0));

    let value = policy
        .execute_with_retry("git.status", || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(lock_contention())
                } else {
                    Ok("clean")
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "clean");
    let stats = policy.stats();
    assert_eq!(stats.successful_executions, 1);
    assert_eq!(stats.total_retries, 2);
    assert_eq!(stats.average_attempts, 3.0);
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn breaker_walks_closed_open_half_open_closed() {
    let cb = breaker(3, Duration::from_secs(60), 1);

    for _ in 0..3 {
        let _ = cb.execute(async { Err::<(), _>(lock_contention()) }).await;
    }
    assert_eq!(cb.state(), CircuitState::Open);

    let polled = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&polled);
    let rejected = cb
        .execute(async move {
            probe.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(rejected, Err(SyncError::CircuitOpen { .. })));
    assert_eq!(polled.load(Ordering::SeqCst), 0, "rejected op must not run");

    tokio::time::advance(Duration::from_secs(61)).await;
    cb.execute(async { Ok(()) }).await.unwrap();
    assert_eq!(cb.state(), CircuitState::Closed);

    let stats = cb.stats();
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.total_failures, 3);
    assert_eq!(stats.total_successes, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens_the_circuit() {
    let cb = breaker(1, Duration::from_secs(10), 2);
    let _ = cb.execute(async { Err::<(), _>(lock_contention()) }).await;
    assert_eq!(cb.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(11)).await;
    let _ = cb.execute(async { Err::<(), _>(lock_contention()) }).await;
    assert_eq!(cb.state(), CircuitState::Open);

    // The reopened circuit waits a fresh recovery period.
    let rejected = cb.execute(async { Ok(()) }).await;
    assert!(matches!(rejected, Err(SyncError::CircuitOpen { .. })));
}

#[tokio::test(start_paused = true)]
async fn open_circuit_cuts_retries_short() {
    let policy = fast_retry(5);
    let cb = breaker(2, Duration::from_secs(60), 1);
    let calls = Arc::new(AtomicU32::new(0));

    let err = with_resilience(&policy, &cb, "git.push", || {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(SyncError::vcs("push", "connection timed out"))
        }
    })
    .await
    .unwrap_err();

    // Two real attempts trip the breaker; the third is rejected and is not
    // retried because an open circuit is not transient.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(matches!(err, SyncError::CircuitOpen { .. }));
    assert_eq!(cb.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn permission_denied_fails_on_first_attempt() {
    let policy = fast_retry(5);
    let cb = breaker(10, Duration::from_secs(60), 1);
    let calls = Arc::new(AtomicU32::new(0));

    let err = with_resilience(&policy, &cb, "rewrite", || {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(SyncError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )))
        }
    })
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err, SyncError::Io(ref e) if e.kind() == std::io::ErrorKind::PermissionDenied));
    assert_eq!(policy.stats().total_retries, 0);
}
