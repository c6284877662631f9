//! # Static Datasource Connector
//!
//! In-process Batch Source and Batch Client over a fixed list of items. Keys are list indexes
//! rendered as decimal strings, so a partition range of `["0", "1000")` covers the first
//! thousand items.
//!
//! Each source call scans `scan_size` indexes from the cursor and slices them into batches
//! of `batch_size`. Every item matches.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::traits::{
    BatchClient, BatchSource, GetNextBatchRangeRequest, GetNextBatchRangeResponse,
    RunBatchRequest, RunBatchResponse,
};
use crate::error::BatchFailure;
use crate::models::{Batch, KeyRange, PrimaryKey};

/// Caller-supplied transform over a slice of static items.
#[async_trait]
pub trait StaticBatchHandler<I>: Send + Sync {
    /// Return `Err` with a diagnostic to fail the batch; it will be retried.
    async fn run_batch(
        &self,
        items: &[I],
        parameters: &HashMap<String, String>,
        dry_run: bool,
    ) -> Result<(), String>;
}

pub struct StaticDatasource<I> {
    items: Arc<Vec<I>>,
    handler: Arc<dyn StaticBatchHandler<I>>,
}

impl<I> Clone for StaticDatasource<I> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<I: Send + Sync + 'static> StaticDatasource<I> {
    pub fn new(items: Vec<I>, handler: Arc<dyn StaticBatchHandler<I>>) -> Self {
        Self {
            items: Arc::new(items),
            handler,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Range covering every item, suitable for a single partition.
    pub fn full_range(&self) -> KeyRange {
        KeyRange::new("0", self.items.len().to_string())
    }

    fn resolve_range(&self, range: &KeyRange) -> Result<(usize, usize), BatchFailure> {
        let start = match &range.start {
            Some(key) => parse_index(key)?,
            None => 0,
        };
        let end = match &range.end {
            Some(key) => parse_index(key)?.min(self.items.len()),
            None => self.items.len(),
        };
        Ok((start, end))
    }
}

fn parse_index(key: &PrimaryKey) -> Result<usize, BatchFailure> {
    key.utf8().parse::<usize>().map_err(|e| {
        BatchFailure::application(
            format!("static datasource key '{key}' is not an index"),
            e.to_string(),
        )
    })
}

#[async_trait]
impl<I: Send + Sync + 'static> BatchSource for StaticDatasource<I> {
    async fn get_next_batch_range(
        &self,
        request: GetNextBatchRangeRequest,
    ) -> Result<GetNextBatchRangeResponse, BatchFailure> {
        let (range_start, range_end) = self.resolve_range(&request.backfill_range)?;
        let batching_start = match &request.previous_end_key {
            Some(key) => parse_index(key)?,
            None => range_start,
        };

        let batch_size = usize::try_from(request.batch_size.max(1)).unwrap_or(1);
        let scan_size = usize::try_from(request.scan_size.max(1)).unwrap_or(1);
        let scan_end = batching_start.saturating_add(scan_size).min(range_end);

        let batches = (batching_start..scan_end)
            .step_by(batch_size)
            .take(request.batch_limit.max(1))
            .map(|batch_start| {
                let batch_end = (batch_start + batch_size).min(range_end);
                let count = (batch_end - batch_start) as i64;
                Batch::new(
                    batch_start.to_string(),
                    batch_end.to_string(),
                    count,
                    count,
                )
            })
            .collect();

        Ok(GetNextBatchRangeResponse { batches })
    }
}

#[async_trait]
impl<I: Send + Sync + 'static> BatchClient for StaticDatasource<I> {
    async fn run_batch(&self, request: RunBatchRequest) -> Result<RunBatchResponse, BatchFailure> {
        let (start, end) = self.resolve_range(&request.batch_range)?;
        let items = self.items.get(start..end).ok_or_else(|| {
            BatchFailure::application(
                "batch range outside static datasource",
                format!("{} with {} items", request.batch_range, self.items.len()),
            )
        })?;

        match self
            .handler
            .run_batch(items, &request.parameters, request.dry_run)
            .await
        {
            Ok(()) => Ok(RunBatchResponse::success()),
            Err(detail) => Ok(RunBatchResponse::with_exception(detail)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use uuid::Uuid;

    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl StaticBatchHandler<u32> for Recorder {
        async fn run_batch(
            &self,
            items: &[u32],
            _parameters: &HashMap<String, String>,
            _dry_run: bool,
        ) -> Result<(), String> {
            if items.contains(&13) {
                return Err("unlucky item".to_string());
            }
            self.seen.lock().extend_from_slice(items);
            Ok(())
        }
    }

    fn datasource(size: u32) -> (Arc<Recorder>, StaticDatasource<u32>) {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let source = StaticDatasource::new((0..size).collect(), recorder.clone());
        (recorder, source)
    }

    fn range_request(range: KeyRange, previous_end_key: Option<&str>) -> GetNextBatchRangeRequest {
        GetNextBatchRangeRequest {
            backfill_run_id: Uuid::nil(),
            backfill_name: "static".to_string(),
            partition_name: "only".to_string(),
            backfill_range: range,
            previous_end_key: previous_end_key.map(PrimaryKey::from),
            batch_size: 100,
            scan_size: 200,
            batch_limit: 10,
            compute_time_limit: None,
            precomputing: false,
            parameters: HashMap::new(),
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_batches_follow_cursor_within_scan_size() {
        let (_, source) = datasource(1000);
        let response = source
            .get_next_batch_range(range_request(source.full_range(), Some("200")))
            .await
            .unwrap();
        assert_eq!(
            response.batches,
            vec![
                Batch::new("200", "300", 100, 100),
                Batch::new("300", "400", 100, 100),
            ]
        );
    }

    #[tokio::test]
    async fn test_exhausted_range_returns_no_batches() {
        let (_, source) = datasource(250);
        let response = source
            .get_next_batch_range(range_request(source.full_range(), Some("200")))
            .await
            .unwrap();
        assert_eq!(response.batches, vec![Batch::new("200", "250", 50, 50)]);

        let response = source
            .get_next_batch_range(range_request(source.full_range(), Some("250")))
            .await
            .unwrap();
        assert!(response.is_exhausted());
    }

    #[tokio::test]
    async fn test_run_batch_applies_handler_and_reports_exceptions() {
        let (recorder, source) = datasource(20);
        let request = |start: &str, end: &str| RunBatchRequest {
            backfill_run_id: Uuid::nil(),
            backfill_name: "static".to_string(),
            partition_name: "only".to_string(),
            batch_range: KeyRange::new(start, end),
            parameters: HashMap::new(),
            dry_run: false,
            batch_size: 5,
        };

        let ok = source.run_batch(request("0", "5")).await.unwrap();
        assert_eq!(ok, RunBatchResponse::success());
        assert_eq!(*recorder.seen.lock(), vec![0, 1, 2, 3, 4]);

        let failed = source.run_batch(request("10", "15")).await.unwrap();
        assert_eq!(failed.exception_detail.as_deref(), Some("unlucky item"));
    }

    #[tokio::test]
    async fn test_non_numeric_cursor_is_rejected() {
        let (_, source) = datasource(10);
        let err = source
            .get_next_batch_range(range_request(source.full_range(), Some("abc")))
            .await
            .unwrap_err();
        assert!(err.message.contains("not an index"));
    }
}
