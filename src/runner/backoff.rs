//! Consecutive-failure accounting and dispatch backoff for one runner.
//!
//! Failure counts belong to a slot: the prefetch stage, the precompute stage, and each batch
//! in the execute FIFO keep their own count, and only that slot's success resets it. The
//! backoff deadlines are shared across slots:
//!
//! - the **global** backoff, armed from the backoff schedule after a counted failure;
//! - the **run-batch** backoff, armed by a client-requested delay or `extra_sleep_ms`.
//!
//! Failures that arrive while the global backoff is active are not counted, so a burst of
//! in-flight calls failing against the same outage costs one schedule step.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Try again once the backoff elapses. `counted` is false when the failure landed inside
    /// an active backoff window.
    Retry { delay: Duration, counted: bool },
    /// More consecutive failures than the schedule has steps.
    Exhausted { failures: usize },
}

/// Consecutive failures of one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCount(usize);

impl FailureCount {
    pub fn get(&self) -> usize {
        self.0
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

#[derive(Debug, Default)]
struct Inner {
    global_until: Option<Instant>,
    run_batch_until: Option<Instant>,
}

fn active(deadline: Option<Instant>, now: Instant) -> Option<Instant> {
    deadline.filter(|until| *until > now)
}

#[derive(Debug, Default)]
pub struct FailureTracker {
    inner: Mutex<Inner>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failure against `slot` unless a global backoff is already running.
    pub fn on_failure(&self, slot: &mut FailureCount, schedule: &[Duration]) -> FailureVerdict {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(until) = active(inner.global_until, now) {
            return FailureVerdict::Retry {
                delay: until - now,
                counted: false,
            };
        }

        slot.0 += 1;
        let failures = slot.0;
        match schedule.get(failures - 1) {
            Some(delay) => {
                inner.global_until = Some(now + *delay);
                FailureVerdict::Retry {
                    delay: *delay,
                    counted: true,
                }
            }
            None => FailureVerdict::Exhausted { failures },
        }
    }

    /// Delay the next dispatch without counting a failure. Ignored while already backing off.
    pub fn request_run_batch_backoff(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if active(inner.run_batch_until, now).is_none() {
            inner.run_batch_until = Some(now + delay);
        }
    }

    /// Latest active deadline across both backoffs.
    fn ready_at(&self, include_run_batch: bool) -> Option<Instant> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let global = active(inner.global_until, now);
        let run_batch = include_run_batch
            .then(|| active(inner.run_batch_until, now))
            .flatten();
        global.max(run_batch)
    }

    /// Wait out the global backoff. Source calls use this.
    pub async fn wait_global(&self) {
        while let Some(until) = self.ready_at(false) {
            tokio::time::sleep_until(until).await;
        }
    }

    /// Wait out both backoffs. Client dispatch uses this.
    pub async fn wait_dispatch(&self) {
        while let Some(until) = self.ready_at(true) {
            tokio::time::sleep_until(until).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(ms: &[u64]) -> Vec<Duration> {
        ms.iter().copied().map(Duration::from_millis).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_steps_then_exhausts() {
        let tracker = FailureTracker::new();
        let schedule = schedule(&[1_000, 2_000]);
        let mut slot = FailureCount::default();

        assert_eq!(
            tracker.on_failure(&mut slot, &schedule),
            FailureVerdict::Retry {
                delay: Duration::from_millis(1_000),
                counted: true
            }
        );
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(
            tracker.on_failure(&mut slot, &schedule),
            FailureVerdict::Retry {
                delay: Duration::from_millis(2_000),
                counted: true
            }
        );
        tokio::time::advance(Duration::from_millis(2_000)).await;
        assert_eq!(
            tracker.on_failure(&mut slot, &schedule),
            FailureVerdict::Exhausted { failures: 3 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_inside_backoff_are_not_counted() {
        let tracker = FailureTracker::new();
        let schedule = schedule(&[1_000]);
        let mut first = FailureCount::default();
        let mut second = FailureCount::default();

        tracker.on_failure(&mut first, &schedule);
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(
            tracker.on_failure(&mut second, &schedule),
            FailureVerdict::Retry {
                delay: Duration::from_millis(600),
                counted: false
            }
        );
        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_only_clears_its_own_slot() {
        let tracker = FailureTracker::new();
        let schedule = schedule(&[10]);
        let mut failing = FailureCount::default();
        let mut healthy = FailureCount::default();

        tracker.on_failure(&mut failing, &schedule);
        tokio::time::advance(Duration::from_millis(10)).await;
        healthy.reset();
        assert_eq!(
            tracker.on_failure(&mut failing, &schedule),
            FailureVerdict::Exhausted { failures: 2 }
        );

        failing.reset();
        assert!(matches!(
            tracker.on_failure(&mut failing, &schedule),
            FailureVerdict::Retry { counted: true, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_waits_for_run_batch_backoff() {
        let tracker = FailureTracker::new();
        tracker.request_run_batch_backoff(Duration::from_millis(500));
        // A second request inside the window is ignored.
        tracker.request_run_batch_backoff(Duration::from_millis(5_000));

        let start = Instant::now();
        tracker.wait_global().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        tracker.wait_dispatch().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(5_000));
    }
}
