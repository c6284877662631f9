//! # System Constants
//!
//! Operational defaults for leasing, polling and retry. Every timing value here can be
//! overridden through [`crate::config::BackfillConfig`]; these are the values used when a
//! config layer leaves them unset.

use std::time::Duration;

/// Backoff schedule applied when a run does not specify one, in milliseconds.
pub const DEFAULT_BACKOFF_SCHEDULE_MS: &[u64] = &[5_000, 15_000, 30_000];

/// Lease and scheduling defaults
pub mod leasing {
    use super::Duration;

    /// Long enough to outlast a slow batch, short enough that a crashed worker's partitions
    /// are picked up again within minutes.
    pub const LEASE_DURATION: Duration = Duration::from_secs(5 * 60);

    /// How often each worker looks for unleased partitions.
    pub const HUNT_INTERVAL: Duration = Duration::from_millis(1_000);

    /// Random extra delay added to each hunt so workers drift apart.
    pub const HUNT_JITTER: Duration = Duration::from_millis(4_000);

    /// Partitions claimed per hunt. Kept at one so a run ramps up across the fleet.
    pub const MAX_LEASES_PER_HUNT: usize = 1;
}

/// Runner defaults
pub mod runner {
    use super::Duration;

    /// How often a runner re-reads settings, verifies and extends its lease.
    pub const SETTINGS_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

    /// Time budget handed to the Batch Source per call. Half of a typical RPC timeout.
    pub const COMPUTE_TIME_LIMIT: Duration = Duration::from_millis(5_000);

    /// Batches requested per precompute call; precompute only needs counts.
    pub const PRECOMPUTE_BATCH_LIMIT: usize = 100;

    /// Prefetch buffer size is `num_threads * multiplier`.
    pub const BATCH_QUEUE_THREAD_MULTIPLIER: usize = 3;

    /// Lower bound on batches requested per prefetch call.
    pub const MINIMUM_BATCHES_PER_CALL: usize = 5;
}

pub mod system {
    /// Environment variable prefix for configuration overrides
    pub const CONFIG_ENV_PREFIX: &str = "BACKFILL";
}
