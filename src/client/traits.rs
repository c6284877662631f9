//! # Batch Source and Batch Client Traits
//!
//! The two seams between the engine and the service being backfilled. A Batch Source knows how
//! to find matching records in some backend; a Batch Client applies the caller's transform to
//! one batch. Both may live in-process or behind an RPC.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::BatchFailure;
use crate::models::{Batch, KeyRange, PrimaryKey};

/// Request for the next batch ranges of a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetNextBatchRangeRequest {
    pub backfill_run_id: Uuid,
    pub backfill_name: String,
    pub partition_name: String,
    /// Full range of the partition.
    pub backfill_range: KeyRange,
    /// End of the previously returned batch, `None` on the first call.
    pub previous_end_key: Option<PrimaryKey>,
    pub batch_size: i64,
    pub scan_size: i64,
    /// Upper bound on batches returned by this call.
    pub batch_limit: usize,
    /// Soft time budget; the source may exceed it while computing its final batch.
    pub compute_time_limit: Option<Duration>,
    /// True for the estimation-only scan.
    pub precomputing: bool,
    pub parameters: HashMap<String, String>,
    pub dry_run: bool,
}

/// Ordered batches following `previous_end_key`. Empty means the range is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetNextBatchRangeResponse {
    pub batches: Vec<Batch>,
}

impl GetNextBatchRangeResponse {
    pub fn is_exhausted(&self) -> bool {
        self.batches.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBatchRequest {
    pub backfill_run_id: Uuid,
    pub backfill_name: String,
    pub partition_name: String,
    pub batch_range: KeyRange,
    pub parameters: HashMap<String, String>,
    pub dry_run: bool,
    pub batch_size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunBatchResponse {
    /// Client asks the engine to slow down before the next batch. Not a failure.
    pub backoff_ms: Option<u64>,
    /// The transform raised; treated as a failed batch with this detail kept for operators.
    pub exception_detail: Option<String>,
    /// Part of the batch the client did not get to. The engine re-issues it before the batch
    /// counts as done.
    pub remaining_batch_range: Option<KeyRange>,
}

/// Successful client response, reduced to what the executor acts on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub backoff: Option<Duration>,
    pub remaining_batch_range: Option<KeyRange>,
}

impl RunBatchResponse {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_backoff(backoff_ms: u64) -> Self {
        Self {
            backoff_ms: Some(backoff_ms),
            ..Self::default()
        }
    }

    pub fn with_exception(detail: impl Into<String>) -> Self {
        Self {
            exception_detail: Some(detail.into()),
            ..Self::default()
        }
    }

    /// Partial success: `remaining` still has to be run.
    pub fn partial(remaining: KeyRange) -> Self {
        Self {
            remaining_batch_range: Some(remaining),
            ..Self::default()
        }
    }

    /// Collapse into the unified outcome. An exception detail wins over everything else.
    pub fn into_outcome(self) -> Result<BatchOutcome, BatchFailure> {
        if let Some(detail) = self.exception_detail {
            return Err(BatchFailure::application(
                "client reported an exception running the batch",
                detail,
            ));
        }
        Ok(BatchOutcome {
            backoff: self
                .backoff_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            remaining_batch_range: self.remaining_batch_range,
        })
    }
}

/// Locates matching records for a partition.
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Compute the batches that follow `request.previous_end_key`, in key order.
    ///
    /// Called in two independent modes: `precomputing = true` for progress estimation and
    /// `precomputing = false` for the batches that will actually be executed.
    async fn get_next_batch_range(
        &self,
        request: GetNextBatchRangeRequest,
    ) -> Result<GetNextBatchRangeResponse, BatchFailure>;
}

/// Applies the caller's transform to one batch.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Run one batch. Must be idempotent: batches are delivered at least once.
    async fn run_batch(&self, request: RunBatchRequest) -> Result<RunBatchResponse, BatchFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn test_outcome_success_without_backoff() {
        assert_eq!(
            RunBatchResponse::success().into_outcome(),
            Ok(BatchOutcome::default())
        );
        assert_eq!(
            RunBatchResponse::with_backoff(0).into_outcome(),
            Ok(BatchOutcome::default())
        );
    }

    #[test]
    fn test_outcome_requested_backoff() {
        assert_eq!(
            RunBatchResponse::with_backoff(250)
                .into_outcome()
                .map(|outcome| outcome.backoff),
            Ok(Some(Duration::from_millis(250)))
        );
    }

    #[test]
    fn test_outcome_keeps_remaining_range() {
        let outcome = RunBatchResponse::partial(KeyRange::new("5", "10"))
            .into_outcome()
            .unwrap();
        assert_eq!(outcome.remaining_batch_range, Some(KeyRange::new("5", "10")));
        assert_eq!(outcome.backoff, None);
    }

    #[test]
    fn test_exception_wins_over_remaining_range() {
        let response = RunBatchResponse {
            exception_detail: Some("boom".to_string()),
            remaining_batch_range: Some(KeyRange::new("5", "10")),
            ..RunBatchResponse::default()
        };
        assert!(response.into_outcome().is_err());
    }

    #[test]
    fn test_outcome_exception_is_application_failure() {
        let failure = RunBatchResponse::with_exception("boom")
            .into_outcome()
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Application);
        assert_eq!(failure.detail.as_deref(), Some("boom"));
    }
}
