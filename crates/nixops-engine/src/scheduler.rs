//! C10: scheduling primitives shared by the reconcile loop. The
//! `kube::runtime::Controller` driven from `cmds/nixops-operator` already
//! gives per-object mutual exclusion and watch-triggered re-queues; this
//! module supplies the two things it doesn't: an explicit global concurrency
//! cap, and the exponential-backoff-with-jitter math used both for transient
//! retries and the longer `Unreachable` cap (spec §5).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Exponential backoff with a cap and uniform jitter up to 20% of the capped
/// value, so many resources failing at once don't retry in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct BackoffCalculator {
    pub base: f64,
    pub initial: Duration,
    pub cap: Duration,
}

impl BackoffCalculator {
    pub const fn new(base: f64, initial: Duration, cap: Duration) -> Self {
        Self { base, initial, cap }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.initial.as_secs_f64() * self.base.powi(attempt as i32);
        let capped = raw.min(self.cap.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.0..=(capped * 0.2));
        Duration::from_secs_f64(capped + jitter)
    }
}

/// Default transient-error backoff (spec §5: "exponential base 2.0, initial
/// delay 2 s, cap 30 s").
pub const DEFAULT_SHORT_BACKOFF: BackoffCalculator =
    BackoffCalculator::new(2.0, Duration::from_secs(2), Duration::from_secs(30));

/// Default `Unreachable` backoff (spec §5: "a separate longer cap (>=5
/// min)").
pub const DEFAULT_LONG_BACKOFF: BackoffCalculator =
    BackoffCalculator::new(2.0, Duration::from_secs(2), Duration::from_secs(600));

/// Periodic tick intervals for resources that are currently converged (spec
/// §5: "120 s for NixosConfiguration, 60 s for Machine").
#[derive(Debug, Clone, Copy)]
pub struct TickIntervals {
    pub configuration: Duration,
    pub machine: Duration,
}

impl Default for TickIntervals {
    fn default() -> Self {
        Self {
            configuration: Duration::from_secs(120),
            machine: Duration::from_secs(60),
        }
    }
}

/// Bounds how many reconciles run concurrently across the whole process
/// (spec §5: "A global concurrency cap bounds parallel reconciles").
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }

    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed")
    }
}

pub struct Scheduler {
    pub concurrency: ConcurrencyLimiter,
    pub intervals: TickIntervals,
    pub short_backoff: BackoffCalculator,
    pub long_backoff: BackoffCalculator,
}

impl Scheduler {
    pub fn new(max_parallel: usize, intervals: TickIntervals) -> Self {
        Self {
            concurrency: ConcurrencyLimiter::new(max_parallel),
            intervals,
            short_backoff: DEFAULT_SHORT_BACKOFF,
            long_backoff: DEFAULT_LONG_BACKOFF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_saturates_at_cap() {
        let calc = DEFAULT_SHORT_BACKOFF;
        let d0 = calc.delay(0);
        let d3 = calc.delay(3);
        let d10 = calc.delay(10);
        assert!(d0.as_secs_f64() >= 2.0 && d0.as_secs_f64() < 2.4);
        assert!(d3.as_secs_f64() > d0.as_secs_f64());
        // Far enough out that the exponential would blow past the cap;
        // jitter adds at most 20% on top of it.
        assert!(d10.as_secs_f64() <= 30.0 * 1.2);
    }

    #[test]
    fn long_backoff_cap_exceeds_five_minutes() {
        assert!(DEFAULT_LONG_BACKOFF.cap >= Duration::from_secs(300));
    }

    #[tokio::test]
    async fn concurrency_limiter_bounds_parallel_holders() {
        let limiter = ConcurrencyLimiter::new(1);
        let first = limiter.acquire().await;
        let second = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(second.is_err(), "second acquire should block while first permit is held");
        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(third.is_ok());
    }
}
