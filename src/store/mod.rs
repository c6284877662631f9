//! # Backfill Store
//!
//! Persisted-state surface of the engine. Every method runs as one atomic unit (a single
//! transaction in PostgreSQL, a single lock acquisition in memory).
//!
//! Writes issued by a runner carry its lease token and are refused when the stored token no
//! longer matches, so a superseded runner can never move another runner's cursor.
//!
//! ## Implementations
//!
//! - [`InMemoryBackfillStore`]: tests and embedding
//! - [`PgBackfillStore`]: production, backed by `migrations/0001_backfill.sql`

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    BackfillRun, BackfillState, EventLog, ExecutionProgress, Lease, PrecomputeProgress,
    RecordRates, RunPartition,
};

pub use memory::InMemoryBackfillStore;
pub use postgres::PgBackfillStore;

/// A partition that a hunter may try to lease.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimCandidate {
    pub partition_id: Uuid,
    pub backfill_run_id: Uuid,
    pub partition_name: String,
    pub connector: String,
    /// Lease as observed; the claim only succeeds if it is still stored unchanged.
    pub lease: Option<Lease>,
}

/// Partition and its parent run, read together.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSnapshot {
    pub partition: RunPartition,
    pub run: BackfillRun,
}

impl PartitionSnapshot {
    /// Both the run and the partition are RUNNING.
    pub fn is_running(&self) -> bool {
        self.run.state == BackfillState::Running
            && self.partition.run_state == BackfillState::Running
    }
}

/// Outcome of a lease keeper poll.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseCheck {
    /// Token matched and the lease was extended.
    Held(PartitionSnapshot),
    /// Token matched but the run or partition is no longer RUNNING. The lease was not extended.
    Stopped(PartitionSnapshot),
    /// Another token is stored (or the partition is gone).
    Lost,
}

/// Everything the lease keeper writes on each poll.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRenewal {
    pub expires_at: DateTime<Utc>,
    pub precompute: Option<PrecomputeProgress>,
    pub rates: Option<RecordRates>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionCompletion {
    /// False when the token no longer matched and nothing was written.
    pub partition_completed: bool,
    /// This completion was the last one of the run.
    pub run_completed: bool,
}

/// Operator edits to a live run. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub num_threads: Option<i32>,
    pub batch_size: Option<i64>,
    pub scan_size: Option<i64>,
    pub extra_sleep_ms: Option<i64>,
    pub backoff_schedule: Option<Vec<i64>>,
}

impl RunSettings {
    pub fn apply(&self, run: &mut BackfillRun) {
        if let Some(num_threads) = self.num_threads {
            run.num_threads = num_threads;
        }
        if let Some(batch_size) = self.batch_size {
            run.batch_size = batch_size;
        }
        if let Some(scan_size) = self.scan_size {
            run.scan_size = scan_size;
        }
        if let Some(extra_sleep_ms) = self.extra_sleep_ms {
            run.extra_sleep_ms = extra_sleep_ms;
        }
        if let Some(schedule) = &self.backoff_schedule {
            run.backoff_schedule = Some(schedule.clone());
        }
    }
}

#[async_trait]
pub trait BackfillStore: Send + Sync {
    /// Partitions whose run and own state are RUNNING and whose lease is unset or expired.
    async fn claimable_partitions(&self, now: DateTime<Utc>) -> Result<Vec<ClaimCandidate>>;

    /// Replace the lease only if the stored one still equals `expected`.
    async fn try_claim_lease(
        &self,
        partition_id: Uuid,
        expected: Option<&Lease>,
        new_lease: &Lease,
    ) -> Result<bool>;

    async fn load_snapshot(&self, partition_id: Uuid) -> Result<PartitionSnapshot>;

    /// Verify `token`, then extend the lease and persist the keeper's progress if still
    /// RUNNING.
    async fn refresh_lease(
        &self,
        partition_id: Uuid,
        token: &str,
        renewal: &LeaseRenewal,
    ) -> Result<LeaseCheck>;

    async fn save_progress(
        &self,
        partition_id: Uuid,
        token: &str,
        progress: &ExecutionProgress,
    ) -> Result<bool>;

    async fn save_precompute_progress(
        &self,
        partition_id: Uuid,
        token: &str,
        progress: &PrecomputeProgress,
        done: bool,
    ) -> Result<bool>;

    /// Persist final progress, mark the partition COMPLETE and drop its lease. Marks the run
    /// COMPLETE when every partition is.
    async fn complete_partition(
        &self,
        partition_id: Uuid,
        token: &str,
        progress: &ExecutionProgress,
    ) -> Result<PartitionCompletion>;

    /// Pause the run and its unfinished partitions, storing `last_error` on the failing one.
    async fn pause_run(&self, run_id: Uuid, partition_id: Uuid, last_error: &str) -> Result<bool>;

    async fn release_lease(&self, partition_id: Uuid, token: &str) -> Result<bool>;

    async fn record_event(&self, event: &EventLog) -> Result<()>;

    async fn list_events(&self, run_id: Uuid) -> Result<Vec<EventLog>>;

    /// Create a run with its partitions.
    async fn insert_run(&self, run: &BackfillRun, partitions: &[RunPartition]) -> Result<()>;

    /// Operator state change. Unfinished partitions follow the run; resuming clears
    /// `last_error`.
    async fn update_run_state(&self, run_id: Uuid, state: BackfillState) -> Result<()>;

    /// Operator settings edit, logged as a CONFIG_CHANGE event.
    async fn update_run_settings(&self, run_id: Uuid, settings: &RunSettings) -> Result<()>;
}
