//! # Run Partition
//!
//! A disjoint key sub-range of a run with its own cursor, lease and counters. The partition is
//! the unit of leasing: at most one runner holds a live lease on it at a time.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::backfill_run::BackfillState;
use super::key::{KeyRange, PrimaryKey};

/// Time-bounded ownership claim held by one runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Fresh lease with a random token.
    pub fn issue(now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            expires_at: now + duration,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPartition {
    pub id: Uuid,
    pub backfill_run_id: Uuid,
    pub partition_name: String,
    pub key_range: KeyRange,
    /// Exclusive lower bound of keys not yet processed. Only ever advances.
    pub pkey_cursor: Option<PrimaryKey>,
    /// Progress of the estimation-only scan; independent of `pkey_cursor`.
    pub precomputing_pkey_cursor: Option<PrimaryKey>,
    pub precomputing_done: bool,
    pub lease: Option<Lease>,
    pub run_state: BackfillState,
    pub computed_scanned_record_count: i64,
    pub computed_matching_record_count: i64,
    pub backfilled_scanned_record_count: i64,
    pub backfilled_matching_record_count: i64,
    pub scanned_records_per_minute: Option<i64>,
    pub matching_records_per_minute: Option<i64>,
    /// Diagnostic detail of the failure that last paused this partition.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunPartition {
    pub fn new(backfill_run_id: Uuid, partition_name: impl Into<String>, key_range: KeyRange) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            backfill_run_id,
            partition_name: partition_name.into(),
            key_range,
            pkey_cursor: None,
            precomputing_pkey_cursor: None,
            precomputing_done: false,
            lease: None,
            run_state: BackfillState::Paused,
            computed_scanned_record_count: 0,
            computed_matching_record_count: 0,
            backfilled_scanned_record_count: 0,
            backfilled_matching_record_count: 0,
            scanned_records_per_minute: None,
            matching_records_per_minute: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Unleased or abandoned, so any hunter may take it.
    pub fn lease_available(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().map_or(true, |lease| lease.is_expired(now))
    }

    pub fn holds_lease(&self, token: &str) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.token == token)
    }

    pub fn apply_execution_progress(&mut self, progress: &ExecutionProgress) {
        self.pkey_cursor = progress.pkey_cursor.clone();
        self.backfilled_scanned_record_count = progress.backfilled_scanned_record_count;
        self.backfilled_matching_record_count = progress.backfilled_matching_record_count;
        if let Some(rates) = progress.rates {
            self.apply_rates(rates);
        }
    }

    pub fn apply_precompute_progress(&mut self, progress: &PrecomputeProgress) {
        self.precomputing_pkey_cursor = progress.precomputing_pkey_cursor.clone();
        self.computed_scanned_record_count = progress.computed_scanned_record_count;
        self.computed_matching_record_count = progress.computed_matching_record_count;
    }

    pub fn apply_rates(&mut self, rates: RecordRates) {
        self.scanned_records_per_minute = Some(rates.scanned_per_minute);
        self.matching_records_per_minute = Some(rates.matching_per_minute);
    }
}

/// Projected throughput, in records per minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRates {
    pub scanned_per_minute: i64,
    pub matching_per_minute: i64,
}

/// What the execute stage persists after each confirmed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub pkey_cursor: Option<PrimaryKey>,
    pub backfilled_scanned_record_count: i64,
    pub backfilled_matching_record_count: i64,
    pub rates: Option<RecordRates>,
}

/// What the precompute scan persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecomputeProgress {
    pub precomputing_pkey_cursor: Option<PrimaryKey>,
    pub computed_scanned_record_count: i64,
    pub computed_matching_record_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_availability() {
        let now = Utc::now();
        let mut partition = RunPartition::new(Uuid::new_v4(), "0", KeyRange::new("0", "10"));
        assert!(partition.lease_available(now));

        let lease = Lease::issue(now, Duration::minutes(5));
        let token = lease.token.clone();
        partition.lease = Some(lease);
        assert!(!partition.lease_available(now));
        assert!(partition.lease_available(now + Duration::minutes(5)));
        assert!(partition.holds_lease(&token));
        assert!(!partition.holds_lease("someone-else"));
    }

    #[test]
    fn test_apply_execution_progress_keeps_rates_when_absent() {
        let mut partition = RunPartition::new(Uuid::new_v4(), "0", KeyRange::unbounded());
        partition.apply_rates(RecordRates {
            scanned_per_minute: 60,
            matching_per_minute: 30,
        });
        partition.apply_execution_progress(&ExecutionProgress {
            pkey_cursor: Some("100".into()),
            backfilled_scanned_record_count: 100,
            backfilled_matching_record_count: 50,
            rates: None,
        });
        assert_eq!(partition.pkey_cursor, Some("100".into()));
        assert_eq!(partition.backfilled_matching_record_count, 50);
        assert_eq!(partition.scanned_records_per_minute, Some(60));
    }
}
