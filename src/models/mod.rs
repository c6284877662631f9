//! # Data Model
//!
//! Persisted entities (runs, partitions, event log) and the ephemeral batch type that flows
//! between the prefetch and execute stages.

pub mod backfill_run;
pub mod batch;
pub mod event_log;
pub mod key;
pub mod run_partition;

pub use backfill_run::{BackfillRun, BackfillState};
pub use batch::Batch;
pub use event_log::{EventKind, EventLog};
pub use key::{KeyRange, PrimaryKey};
pub use run_partition::{
    ExecutionProgress, Lease, PrecomputeProgress, RecordRates, RunPartition,
};
