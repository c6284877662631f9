//! Estimation-only scan. Runs alongside real execution with its own cursor so the totals
//! needed for progress and ETA are known well before the partition finishes.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::backoff::{FailureCount, FailureVerdict};
use super::RunnerContext;
use crate::client::GetNextBatchRangeRequest;
use crate::error::Result;
use crate::metrics;
use crate::models::{EventLog, PrecomputeProgress, RunPartition};

pub async fn run(ctx: Arc<RunnerContext>, partition: RunPartition) -> Result<()> {
    let mut progress = PrecomputeProgress {
        precomputing_pkey_cursor: partition.precomputing_pkey_cursor.clone(),
        computed_scanned_record_count: partition.computed_scanned_record_count,
        computed_matching_record_count: partition.computed_matching_record_count,
    };
    let mut failures = FailureCount::default();

    info!(
        partition = %ctx.lease.partition_name,
        cursor = ?progress.precomputing_pkey_cursor,
        "BatchPrecomputer started"
    );

    loop {
        tokio::select! {
            _ = ctx.stop.stopped() => break,
            _ = ctx.failures.wait_global() => {}
        }

        let metadata = ctx.metadata.load();
        let request = GetNextBatchRangeRequest {
            backfill_run_id: metadata.backfill_run_id,
            backfill_name: metadata.backfill_name.clone(),
            partition_name: metadata.partition_name.clone(),
            backfill_range: metadata.key_range.clone(),
            previous_end_key: progress.precomputing_pkey_cursor.clone(),
            batch_size: metadata.batch_size,
            scan_size: metadata.scan_size,
            batch_limit: ctx.settings.runner.precompute_batch_limit,
            compute_time_limit: Some(ctx.settings.runner.compute_time_limit()),
            precomputing: true,
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
                KeyValue::new("precomputing", true),
            ],
        );

        match response {
            Ok(response) if response.is_exhausted() => {
                failures.reset();
                let saved = ctx
                    .store
                    .save_precompute_progress(
                        ctx.lease.partition_id,
                        &ctx.lease.lease_token,
                        &progress,
                        true,
                    )
                    .await?;
                if !saved {
                    ctx.lease_lost("saving precompute totals");
                    break;
                }
                ctx.progress.lock().pending_precompute = None;
                info!(
                    partition = %ctx.lease.partition_name,
                    scanned = progress.computed_scanned_record_count,
                    matching = progress.computed_matching_record_count,
                    "Precomputing complete"
                );
                ctx.log_event(EventLog::state_change(
                    ctx.lease.backfill_run_id,
                    Some(ctx.lease.partition_id),
                    format!(
                        "precomputing complete: {} matching of {} scanned",
                        progress.computed_matching_record_count,
                        progress.computed_scanned_record_count
                    ),
                ))
                .await;
                break;
            }
            Ok(response) => {
                failures.reset();
                for batch in &response.batches {
                    progress.computed_scanned_record_count += batch.scanned_record_count;
                    progress.computed_matching_record_count += batch.matching_record_count;
                    progress.precomputing_pkey_cursor = Some(batch.end.clone());
                }
                debug!(
                    partition = %ctx.lease.partition_name,
                    batches = response.batches.len(),
                    computed_matching = progress.computed_matching_record_count,
                    "Precomputed batch ranges"
                );
                // Persisted by the lease keeper on its next poll.
                ctx.progress.lock().pending_precompute = Some(progress.clone());
            }
            Err(failure) => {
                if let FailureVerdict::Exhausted { .. } =
                    ctx.record_failure(&mut failures, &failure, "precomputing batch").await?
                {
                    break;
                }
            }
        }
    }

    info!(partition = %ctx.lease.partition_name, "BatchPrecomputer stopped");
    Ok(())
}
