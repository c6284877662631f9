//! Shared fixtures for pipeline tests: seeded runs, scripted Batch Sources and Clients.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use backfill_core::client::{
    BatchClient, BatchSource, GetNextBatchRangeRequest, GetNextBatchRangeResponse,
    RunBatchRequest, RunBatchResponse, StaticBatchHandler, StaticDatasource,
};
use backfill_core::config::SchedulerConfig;
use backfill_core::models::{
    BackfillRun, BackfillState, Batch, KeyRange, PrimaryKey, RunPartition,
};
use backfill_core::registry::{Connector, ConnectorRegistry};
use backfill_core::runner::{BackfillRunner, RunnerSettings};
use backfill_core::scheduler::LeaseHunter;
use backfill_core::store::{BackfillStore, InMemoryBackfillStore};
use backfill_core::BatchFailure;

pub const CONNECTOR: &str = "fake";

/// A RUNNING run with one RUNNING partition over `range`.
pub async fn seed_run(
    store: &InMemoryBackfillStore,
    range: KeyRange,
    configure: impl FnOnce(&mut BackfillRun, &mut RunPartition),
) -> (BackfillRun, RunPartition) {
    let mut run = BackfillRun::new("copy_users", CONNECTOR, "operator");
    run.state = BackfillState::Running;
    run.dry_run = false;
    let mut partition = RunPartition::new(run.id, "shard-0", range);
    partition.run_state = BackfillState::Running;
    configure(&mut run, &mut partition);

    store
        .insert_run(&run, std::slice::from_ref(&partition))
        .await
        .expect("seed run");
    (run, partition)
}

pub fn hunter(store: &InMemoryBackfillStore, connector: Connector) -> LeaseHunter {
    hunter_with_settings(store, connector, RunnerSettings::default())
}

pub fn hunter_with_settings(
    store: &InMemoryBackfillStore,
    connector: Connector,
    settings: RunnerSettings,
) -> LeaseHunter {
    let registry = ConnectorRegistry::new();
    registry.register(CONNECTOR, connector);
    LeaseHunter::new(
        Arc::new(store.clone()),
        Arc::new(registry),
        settings,
        &SchedulerConfig::default(),
    )
}

/// Lease the single seeded partition and return its runner.
pub async fn lease_runner(store: &InMemoryBackfillStore, connector: Connector) -> BackfillRunner {
    lease_runner_with_settings(store, connector, RunnerSettings::default()).await
}

pub async fn lease_runner_with_settings(
    store: &InMemoryBackfillStore,
    connector: Connector,
    settings: RunnerSettings,
) -> BackfillRunner {
    let mut runners = hunter_with_settings(store, connector, settings)
        .hunt()
        .await
        .expect("hunt");
    assert_eq!(runners.len(), 1, "expected exactly one claimable partition");
    runners.remove(0)
}

/// Parse a zero-padded or plain decimal key.
pub fn key_index(key: Option<&PrimaryKey>) -> usize {
    key.map(|key| key.utf8().parse().expect("numeric key"))
        .unwrap_or(0)
}

// ============================================================================
// Static datasource
// ============================================================================

/// Handler that records every item it sees.
#[derive(Default)]
pub struct CollectingHandler {
    pub seen: Mutex<Vec<u32>>,
}

#[async_trait]
impl StaticBatchHandler<u32> for CollectingHandler {
    async fn run_batch(
        &self,
        items: &[u32],
        _parameters: &HashMap<String, String>,
        _dry_run: bool,
    ) -> Result<(), String> {
        self.seen.lock().extend_from_slice(items);
        Ok(())
    }
}

pub fn static_connector(size: u32) -> (Arc<CollectingHandler>, StaticDatasource<u32>, Connector) {
    let handler = Arc::new(CollectingHandler::default());
    let datasource = StaticDatasource::new((0..size).collect(), handler.clone());
    let connector = Connector::from_shared(Arc::new(datasource.clone()));
    (handler, datasource, connector)
}

// ============================================================================
// Scripted source and client
// ============================================================================

/// Serves a fixed list of contiguous batches, honoring the cursor and `batch_limit`.
pub struct ListSource {
    batches: Vec<Batch>,
    latency: Duration,
}

impl ListSource {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches,
            latency: Duration::ZERO,
        }
    }

    /// Delay every call, prefetch and precompute alike.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// `count` batches of `width` keys each, every record matching.
    pub fn uniform(count: usize, width: usize) -> Self {
        let batches = (0..count)
            .map(|i| {
                let start = i * width;
                let end = start + width;
                Batch::new(
                    format!("{start:06}"),
                    format!("{end:06}"),
                    width as i64,
                    width as i64,
                )
            })
            .collect();
        Self::new(batches)
    }

    pub fn range(&self) -> KeyRange {
        match (self.batches.first(), self.batches.last()) {
            (Some(first), Some(last)) => KeyRange::new(first.start.clone(), last.end.clone()),
            _ => KeyRange::unbounded(),
        }
    }
}

#[async_trait]
impl BatchSource for ListSource {
    async fn get_next_batch_range(
        &self,
        request: GetNextBatchRangeRequest,
    ) -> Result<GetNextBatchRangeResponse, BatchFailure> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let from = match &request.previous_end_key {
            Some(cursor) => self
                .batches
                .iter()
                .position(|batch| &batch.start == cursor)
                .unwrap_or(self.batches.len()),
            None => 0,
        };
        let batches = self.batches[from..]
            .iter()
            .take(request.batch_limit.max(1))
            .cloned()
            .collect();
        Ok(GetNextBatchRangeResponse { batches })
    }
}

#[derive(Debug, Clone)]
pub struct ClientCall {
    pub range: KeyRange,
    pub at: Instant,
    /// Calls in flight including this one.
    pub in_flight: usize,
}

/// Batch Client with configurable latency, failures and requested backoff.
pub struct ScriptedClient {
    latency: Duration,
    failures_remaining: AtomicUsize,
    backoff_ms: Option<u64>,
    partial_width: Option<usize>,
    in_flight: AtomicUsize,
    completed: AtomicUsize,
    calls: Mutex<Vec<ClientCall>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            failures_remaining: AtomicUsize::new(0),
            backoff_ms: None,
            partial_width: None,
            in_flight: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the first `count` calls. `usize::MAX` fails every call.
    pub fn failing_first(self, count: usize) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub fn requesting_backoff(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = Some(backoff_ms);
        self
    }

    /// Ranges wider than `width` keys are only partly run: the client reports everything past
    /// the first `width` keys as remaining. Keys are zero-padded to six digits.
    pub fn completing_at_most(mut self, width: usize) -> Self {
        self.partial_width = Some(width);
        self
    }

    /// Calls that ran to the end of their latency.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .map(|call| call.in_flight)
            .max()
            .unwrap_or(0)
    }
}

#[async_trait]
impl BatchClient for ScriptedClient {
    async fn run_batch(&self, request: RunBatchRequest) -> Result<RunBatchResponse, BatchFailure> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.lock().push(ClientCall {
            range: request.batch_range.clone(),
            at: Instant::now(),
            in_flight,
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);

        let fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if fail {
            return Err(BatchFailure::transport("client unavailable"));
        }

        if let Some(width) = self.partial_width {
            let start = key_index(request.batch_range.start.as_ref());
            let end = key_index(request.batch_range.end.as_ref());
            if end - start > width {
                let remaining = KeyRange::new(format!("{:06}", start + width), format!("{end:06}"));
                return Ok(RunBatchResponse::partial(remaining));
            }
        }

        Ok(match self.backoff_ms {
            Some(ms) => RunBatchResponse::with_backoff(ms),
            None => RunBatchResponse::success(),
        })
    }
}
