use serde::{Deserialize, Serialize};
use std::fmt;

use super::key::PrimaryKey;

/// A contiguous `[start, end)` slice of a partition, produced once by the Batch Source and
/// consumed once by the Batch Client. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub start: PrimaryKey,
    pub end: PrimaryKey,
    pub scanned_record_count: i64,
    pub matching_record_count: i64,
}

impl Batch {
    pub fn new(
        start: impl Into<PrimaryKey>,
        end: impl Into<PrimaryKey>,
        scanned_record_count: i64,
        matching_record_count: i64,
    ) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            scanned_record_count,
            matching_record_count,
        }
    }

    /// Batches with nothing to transform are committed without a Batch Client call.
    pub fn has_matches(&self) -> bool {
        self.matching_record_count > 0
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}) scanned={} matching={}",
            self.start, self.end, self.scanned_record_count, self.matching_record_count
        )
    }
}
