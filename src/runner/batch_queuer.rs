//! Prefetch stage: computes upcoming batch ranges ahead of execution.
//!
//! Starts at the persisted cursor and then follows its own cursor, which runs ahead of the
//! committed one by however many batches are buffered.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::backoff::{FailureCount, FailureVerdict};
use super::RunnerContext;
use crate::channel::ChannelSender;
use crate::client::GetNextBatchRangeRequest;
use crate::error::Result;
use crate::metrics;
use crate::models::{Batch, PrimaryKey};
use opentelemetry::KeyValue;

pub async fn run(
    ctx: Arc<RunnerContext>,
    sender: ChannelSender<Batch>,
    cursor: Option<PrimaryKey>,
) -> Result<()> {
    let result = produce(&ctx, &sender, cursor).await;
    if result.is_err() {
        // Dropping the sender would close the channel and read as an exhausted range.
        sender.cancel();
    }
    result
}

async fn produce(
    ctx: &RunnerContext,
    sender: &ChannelSender<Batch>,
    mut cursor: Option<PrimaryKey>,
) -> Result<()> {
    let mut failures = FailureCount::default();
    info!(
        partition = %ctx.lease.partition_name,
        capacity = ctx.queue.capacity(),
        "BatchQueuer started"
    );

    loop {
        if ctx.stop.is_stopped() {
            break;
        }

        tokio::select! {
            _ = ctx.stop.stopped() => break,
            _ = ctx.failures.wait_global() => {}
        }

        let metadata = ctx.metadata.load();
        let batch_limit = ctx
            .queue
            .capacity()
            .max(ctx.settings.runner.minimum_batches_per_call);
        let request = GetNextBatchRangeRequest {
            backfill_run_id: metadata.backfill_run_id,
            backfill_name: metadata.backfill_name.clone(),
            partition_name: metadata.partition_name.clone(),
            backfill_range: metadata.key_range.clone(),
            previous_end_key: cursor.clone(),
            batch_size: metadata.batch_size,
            scan_size: metadata.scan_size,
            batch_limit,
            compute_time_limit: Some(ctx.settings.runner.compute_time_limit()),
            precomputing: false,
            parameters: metadata.parameters.clone(),
            dry_run: metadata.dry_run,
        };

        let started = Instant::now();
        let response = tokio::select! {
            _ = ctx.stop.stopped() => break,
            response = ctx.connector.source.get_next_batch_range(request) => response,
        };
        let labels = ctx.labels();
        metrics::source_call_duration_ms().record(
            started.elapsed().as_secs_f64() * 1_000.0,
            &[
                labels[0].clone(),
                labels[1].clone(),
                KeyValue::new("precomputing", false),
            ],
        );

        match response {
            Ok(response) if response.is_exhausted() => {
                info!(
                    partition = %ctx.lease.partition_name,
                    "No more batches, finished computing"
                );
                failures.reset();
                sender.close();
                break;
            }
            Ok(response) => {
                failures.reset();
                debug!(
                    partition = %ctx.lease.partition_name,
                    batches = response.batches.len(),
                    "Computed batch ranges"
                );
                for batch in response.batches {
                    let end = batch.end.clone();
                    if sender.send(batch).await.is_err() {
                        debug!("Batch queue cancelled while sending");
                        return Ok(());
                    }
                    cursor = Some(end);
                }
            }
            Err(failure) => {
                if let FailureVerdict::Exhausted { .. } =
                    ctx.record_failure(&mut failures, &failure, "computing batch").await?
                {
                    break;
                }
            }
        }
    }

    info!(partition = %ctx.lease.partition_name, "BatchQueuer stopped");
    Ok(())
}
