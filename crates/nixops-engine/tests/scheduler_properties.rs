//! Black-box coverage of the scheduler's concurrency cap and backoff math
//! (spec §5): a global semaphore bounds parallel reconciles regardless of
//! how many callers race for a permit, and repeated failures back off
//! exponentially up to, but never unboundedly past, the configured cap.

use std::time::Duration;

use nixops_engine::scheduler::{BackoffCalculator, ConcurrencyLimiter};

#[tokio::test]
async fn concurrency_cap_admits_exactly_n_at_once() {
    let limiter = ConcurrencyLimiter::new(3);
    let permits = futures::future::join_all((0..3).map(|_| limiter.acquire())).await;
    assert_eq!(permits.len(), 3);

    let fourth = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
    assert!(fourth.is_err(), "a fourth permit should block while three are held");

    drop(permits);
    let fifth = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
    assert!(fifth.is_ok(), "releasing held permits should free capacity immediately");
}

#[tokio::test]
async fn many_concurrent_acquirers_never_exceed_the_cap() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let limiter = ConcurrencyLimiter::new(2);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let max_observed = max_observed.clone();
            tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
    assert!(max_observed.load(Ordering::SeqCst) <= 2);
}

#[test]
fn backoff_is_monotonically_nondecreasing_until_the_cap() {
    let calc = BackoffCalculator::new(2.0, Duration::from_secs(1), Duration::from_secs(20));
    let delays: Vec<f64> = (0..8).map(|attempt| calc.delay(attempt).as_secs_f64()).collect();
    for window in delays.windows(2) {
        // jitter can add up to 20% noise, but the underlying exponential
        // term is nondecreasing, so even the worst-case low/high jitter
        // pairing stays within the cap's own jitter envelope.
        assert!(window[1] >= window[0] * 0.8);
    }
    assert!(delays.last().unwrap() <= &(20.0 * 1.2));
}

#[test]
fn distinct_calculators_do_not_share_cap_or_base() {
    let short = BackoffCalculator::new(2.0, Duration::from_secs(2), Duration::from_secs(30));
    let long = BackoffCalculator::new(2.0, Duration::from_secs(2), Duration::from_secs(600));
    assert!(long.delay(10).as_secs_f64() > short.delay(10).as_secs_f64());
}
