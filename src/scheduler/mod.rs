//! # Scheduling
//!
//! Decides which partitions this worker runs: the [`LeaseHunter`] claims leases and the
//! [`RunnerScheduler`] drives hunting on an interval and owns the spawned runners.

pub mod lease_hunter;
pub mod runner_scheduler;

pub use lease_hunter::LeaseHunter;
pub use runner_scheduler::RunnerScheduler;
