//! Execute stage: runs prefetched batches against the Batch Client.
//!
//! Up to `num_threads` calls are in flight in a FIFO. Results are committed strictly in the
//! order batches were dequeued, so the persisted cursor only ever moves to the end of the
//! oldest unconfirmed batch. A failed batch goes back to the front of the FIFO and is retried
//! once the backoff elapses; later batches may finish meanwhile but wait behind it. Each batch
//! carries its own failure count, reset when its client call succeeds.
//!
//! A client may finish only part of a batch and hand back the remaining range. The remainder
//! is re-issued at the front of the FIFO and the batch commits once nothing remains.
//!
//! Batches with no matching records are committed without calling the client.
//!
//! On stop no new call starts. Calls already running are awaited and their results discarded.

use futures::future::BoxFuture;
use futures::stream::{FuturesOrdered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::backoff::{FailureCount, FailureVerdict};
use super::{RunnerContext, RunnerState};
use crate::channel::{ChannelError, ChannelReceiver};
use crate::client::{BatchOutcome, RunBatchRequest};
use crate::error::{BatchFailure, Result};
use crate::logging::log_partition_operation;
use crate::metrics;
use crate::models::{
    Batch, EventLog, ExecutionProgress, KeyRange, PrimaryKey, RecordRates, RunPartition,
};

/// A dequeued batch and the part of it still to run.
struct PendingBatch {
    batch: Batch,
    range: KeyRange,
    failures: FailureCount,
}

impl PendingBatch {
    fn new(batch: Batch) -> Self {
        let range = KeyRange::new(batch.start.clone(), batch.end.clone());
        Self {
            batch,
            range,
            failures: FailureCount::default(),
        }
    }
}

enum Outcome {
    Succeeded(BatchOutcome),
    Failed(BatchFailure),
    /// Stopped while waiting out a backoff; the client was never called.
    Abandoned,
}

/// One finished client call, or a zero-match batch that skipped the call.
struct Attempt {
    pending: PendingBatch,
    outcome: Outcome,
    elapsed: Option<Duration>,
}

type InFlight = FuturesOrdered<BoxFuture<'static, Attempt>>;

/// Committed position of the partition.
#[derive(Debug, Clone)]
struct Committed {
    cursor: Option<PrimaryKey>,
    scanned: i64,
    matching: i64,
}

impl Committed {
    fn progress(&self, rates: Option<RecordRates>) -> ExecutionProgress {
        ExecutionProgress {
            pkey_cursor: self.cursor.clone(),
            backfilled_scanned_record_count: self.scanned,
            backfilled_matching_record_count: self.matching,
            rates,
        }
    }
}

fn dispatch(
    ctx: &Arc<RunnerContext>,
    pending: PendingBatch,
    wait_for_backoff: bool,
) -> BoxFuture<'static, Attempt> {
    if !pending.batch.has_matches() {
        return futures::future::ready(Attempt {
            pending,
            outcome: Outcome::Succeeded(BatchOutcome::default()),
            elapsed: None,
        })
        .boxed();
    }

    let metadata = ctx.metadata.load();
    let request = RunBatchRequest {
        backfill_run_id: metadata.backfill_run_id,
        backfill_name: metadata.backfill_name.clone(),
        partition_name: metadata.partition_name.clone(),
        batch_range: pending.range.clone(),
        parameters: metadata.parameters.clone(),
        dry_run: metadata.dry_run,
        batch_size: metadata.batch_size,
    };
    let ctx = Arc::clone(ctx);

    async move {
        if wait_for_backoff {
            tokio::select! {
                biased;
                _ = ctx.stop.stopped() => {
                    return Attempt {
                        pending,
                        outcome: Outcome::Abandoned,
                        elapsed: None,
                    };
                }
                _ = ctx.failures.wait_dispatch() => {}
            }
        }
        let started = Instant::now();
        let outcome = match ctx
            .connector
            .client
            .run_batch(request)
            .await
            .and_then(|response| response.into_outcome())
        {
            Ok(outcome) => Outcome::Succeeded(outcome),
            Err(failure) => Outcome::Failed(failure),
        };
        Attempt {
            pending,
            outcome,
            elapsed: Some(started.elapsed()),
        }
    }
    .boxed()
}

pub async fn run(
    ctx: Arc<RunnerContext>,
    receiver: ChannelReceiver<Batch>,
    partition: RunPartition,
) -> Result<()> {
    let mut committed = Committed {
        cursor: partition.pkey_cursor.clone(),
        scanned: partition.backfilled_scanned_record_count,
        matching: partition.backfilled_matching_record_count,
    };
    let mut in_flight: InFlight = FuturesOrdered::new();

    info!(
        partition = %ctx.lease.partition_name,
        cursor = ?committed.cursor,
        "BatchExecutor started"
    );

    let result = execute(&ctx, receiver, &mut in_flight, &mut committed).await;
    if result.is_err() {
        ctx.stop.stop();
    }
    drain(&ctx, in_flight).await;

    info!(
        partition = %ctx.lease.partition_name,
        cursor = ?committed.cursor,
        "BatchExecutor stopped"
    );
    result
}

async fn execute(
    ctx: &Arc<RunnerContext>,
    mut receiver: ChannelReceiver<Batch>,
    in_flight: &mut InFlight,
    committed: &mut Committed,
) -> Result<()> {
    let mut upstream_done = false;

    loop {
        if upstream_done && in_flight.is_empty() {
            return complete(ctx, committed).await;
        }

        let capacity = ctx.metadata.load().num_threads;
        let can_dispatch = !upstream_done && in_flight.len() < capacity;
        let next_batch = async {
            ctx.failures.wait_dispatch().await;
            receiver.recv().await
        };

        tokio::select! {
            biased;
            _ = ctx.stop.stopped() => return Ok(()),
            Some(attempt) = in_flight.next(), if !in_flight.is_empty() => {
                let Attempt { mut pending, outcome, elapsed } = attempt;
                match outcome {
                    Outcome::Succeeded(outcome) => {
                        pending.failures.reset();
                        let extra_sleep = ctx.metadata.load().extra_sleep;
                        match outcome.backoff {
                            Some(delay) => ctx.failures.request_run_batch_backoff(delay),
                            None if pending.batch.has_matches() => {
                                ctx.failures.request_run_batch_backoff(extra_sleep)
                            }
                            None => {}
                        }

                        if let Some(remaining) = outcome.remaining_batch_range {
                            debug!(
                                partition = %ctx.lease.partition_name,
                                batch = %pending.batch,
                                remaining = %remaining,
                                "Continuing remaining range of partially completed batch"
                            );
                            pending.range = remaining;
                            in_flight.push_front(dispatch(ctx, pending, true));
                        } else if !commit(ctx, committed, &pending.batch, elapsed).await? {
                            return Ok(());
                        }
                    }
                    Outcome::Failed(failure) => {
                        match ctx
                            .record_failure(&mut pending.failures, &failure, "running batch")
                            .await?
                        {
                            FailureVerdict::Exhausted { .. } => return Ok(()),
                            FailureVerdict::Retry { .. } => {
                                in_flight.push_front(dispatch(ctx, pending, true));
                            }
                        }
                    }
                    Outcome::Abandoned => return Ok(()),
                }
            }
            next = next_batch, if can_dispatch => match next {
                Ok(batch) => in_flight.push_back(dispatch(ctx, PendingBatch::new(batch), false)),
                Err(ChannelError::Closed) => {
                    debug!(partition = %ctx.lease.partition_name, "Batch queue drained");
                    upstream_done = true;
                }
                Err(_) => return Ok(()),
            },
        }
    }
}

/// Let calls that already reached the client finish. Their results are not committed.
async fn drain(ctx: &RunnerContext, mut in_flight: InFlight) {
    if in_flight.is_empty() {
        return;
    }
    info!(
        partition = %ctx.lease.partition_name,
        in_flight = in_flight.len(),
        "Waiting for in-flight batches to finish"
    );
    while let Some(attempt) = in_flight.next().await {
        debug!(
            partition = %ctx.lease.partition_name,
            batch = %attempt.pending.batch,
            "Discarding in-flight batch result"
        );
    }
}

/// Apply one successful batch. Returns false when the lease was lost.
async fn commit(
    ctx: &RunnerContext,
    committed: &mut Committed,
    batch: &Batch,
    elapsed: Option<Duration>,
) -> Result<bool> {
    committed.cursor = Some(batch.end.clone());
    committed.scanned += batch.scanned_record_count;
    committed.matching += batch.matching_record_count;

    let rates = {
        let mut progress = ctx.progress.lock();
        progress.record_batch(batch);
        progress.rates()
    };

    let labels = ctx.labels();
    metrics::batches_completed().add(1, &labels);
    metrics::records_scanned().add(batch.scanned_record_count.max(0) as u64, &labels);
    metrics::records_matched().add(batch.matching_record_count.max(0) as u64, &labels);
    if let Some(elapsed) = elapsed {
        metrics::batch_duration_ms().record(elapsed.as_secs_f64() * 1_000.0, &labels);
    }

    let saved = ctx
        .store
        .save_progress(
            ctx.lease.partition_id,
            &ctx.lease.lease_token,
            &committed.progress(Some(rates)),
        )
        .await?;
    if !saved {
        ctx.lease_lost("saving batch progress");
        return Ok(false);
    }

    debug!(
        partition = %ctx.lease.partition_name,
        batch = %batch,
        backfilled_matching = committed.matching,
        "Batch committed"
    );
    Ok(true)
}

async fn complete(ctx: &RunnerContext, committed: &Committed) -> Result<()> {
    let rates = ctx.progress.lock().rates();
    let completion = ctx
        .store
        .complete_partition(
            ctx.lease.partition_id,
            &ctx.lease.lease_token,
            &committed.progress(Some(rates)),
        )
        .await?;

    if !completion.partition_completed {
        ctx.lease_lost("completing partition");
        return Ok(());
    }
    ctx.finish(RunnerState::Complete);

    info!(
        partition = %ctx.lease.partition_name,
        backfilled_scanned = committed.scanned,
        backfilled_matching = committed.matching,
        "✅ RUNNER: Partition complete"
    );
    log_partition_operation(
        "complete",
        ctx.lease.backfill_run_id,
        &ctx.lease.partition_name,
        "complete",
        None,
    );
    ctx.log_event(EventLog::state_change(
        ctx.lease.backfill_run_id,
        Some(ctx.lease.partition_id),
        format!("partition {} completed", ctx.lease.partition_name),
    ))
    .await;

    if completion.run_completed {
        info!(backfill_run_id = %ctx.lease.backfill_run_id, "Backfill run complete");
        ctx.log_event(EventLog::state_change(
            ctx.lease.backfill_run_id,
            None,
            "backfill run completed",
        ))
        .await;
    }
    Ok(())
}
