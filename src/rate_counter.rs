//! # Rate Counter
//!
//! Sliding-window throughput estimator. Counts are bucketed per epoch second and summed over
//! a trailing lookback window (one minute by default).
//!
//! Right after a runner starts the window is mostly empty, so the plain sum under-reports.
//! [`RateCounter::projected_rate`] scales the sum up by how much of the window has elapsed
//! and converges to the plain sum once a full window has passed.

use std::collections::VecDeque;

use crate::clock::SharedClock;

pub const DEFAULT_LOOKBACK_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    second: i64,
    count: i64,
}

#[derive(Debug)]
pub struct RateCounter {
    clock: SharedClock,
    lookback_seconds: i64,
    buckets: VecDeque<Bucket>,
    sum: i64,
    /// Cleared once a full lookback has elapsed; projection is a plain sum from then on.
    started_at: Option<i64>,
}

impl RateCounter {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_lookback(clock, DEFAULT_LOOKBACK_SECONDS)
    }

    pub fn with_lookback(clock: SharedClock, lookback_seconds: i64) -> Self {
        let started_at = Some(clock.epoch_seconds());
        Self {
            clock,
            lookback_seconds: lookback_seconds.max(1),
            buckets: VecDeque::new(),
            sum: 0,
            started_at,
        }
    }

    pub fn add(&mut self, count: i64) {
        let second = self.clock.epoch_seconds();
        match self.buckets.back_mut() {
            Some(last) if last.second == second => last.count += count,
            _ => self.buckets.push_back(Bucket { second, count }),
        }
        self.sum += count;
    }

    /// Total of all counts added within the lookback window.
    pub fn sum(&mut self) -> i64 {
        let now = self.clock.epoch_seconds();
        while let Some(first) = self.buckets.front() {
            if now - first.second > self.lookback_seconds {
                self.sum -= first.count;
                self.buckets.pop_front();
            } else {
                break;
            }
        }
        self.sum
    }

    /// Rate per lookback window, extrapolated while the window is still filling.
    pub fn projected_rate(&mut self) -> i64 {
        let Some(started_at) = self.started_at else {
            return self.sum();
        };

        let elapsed = self.clock.epoch_seconds() - started_at;
        if elapsed >= self.lookback_seconds {
            self.started_at = None;
            return self.sum();
        }

        let multiple = self.lookback_seconds / elapsed.max(1);
        self.sum() * multiple
    }
}
