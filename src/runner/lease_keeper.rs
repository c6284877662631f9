//! Settings poll and lease heartbeat.
//!
//! Every `settings_poll_interval` the keeper re-reads the run and partition, verifies the
//! lease token, extends the lease and persists precompute progress and rate estimates, all in
//! one store call. A different token means another runner took over; a run or partition that
//! is no longer RUNNING means an operator paused or cancelled it. Either way the runner stops.

use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::metadata::BackfillMetadata;
use super::{lease_expiry, RunnerContext, RunnerState};
use crate::error::Result;
use crate::metrics;
use crate::store::{LeaseCheck, LeaseRenewal, PartitionSnapshot};

pub async fn run(ctx: Arc<RunnerContext>) -> Result<()> {
    let mut interval = tokio::time::interval(ctx.settings.runner.settings_poll_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the snapshot was just loaded.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = ctx.stop.stopped() => break,
            _ = interval.tick() => {}
        }

        let (precompute, rates) = {
            let mut progress = ctx.progress.lock();
            (progress.pending_precompute.take(), progress.rates())
        };
        let renewal = LeaseRenewal {
            expires_at: lease_expiry(&ctx.settings),
            precompute,
            rates: Some(rates),
        };

        let check = ctx
            .store
            .refresh_lease(ctx.lease.partition_id, &ctx.lease.lease_token, &renewal)
            .await;

        match check {
            Ok(LeaseCheck::Held(snapshot)) => apply_snapshot(&ctx, &snapshot),
            Ok(LeaseCheck::Stopped(snapshot)) => {
                info!(
                    partition = %ctx.lease.partition_name,
                    run_state = %snapshot.run.state,
                    partition_state = %snapshot.partition.run_state,
                    "Backfill no longer running, stopping runner"
                );
                ctx.finish(RunnerState::Stopped);
                break;
            }
            Ok(LeaseCheck::Lost) => {
                ctx.lease_lost("settings poll");
                break;
            }
            Err(e) => {
                // The lease outlives several polls, so one failed heartbeat is not fatal.
                warn!(
                    partition = %ctx.lease.partition_name,
                    error = %e,
                    "Lease refresh failed, retrying next poll"
                );
                if let Some(precompute) = renewal.precompute {
                    ctx.progress
                        .lock()
                        .pending_precompute
                        .get_or_insert(precompute);
                }
            }
        }
    }

    debug!(partition = %ctx.lease.partition_name, "Lease keeper stopped");
    Ok(())
}

fn apply_snapshot(ctx: &RunnerContext, snapshot: &PartitionSnapshot) {
    let metadata = BackfillMetadata::from_snapshot(
        snapshot,
        &ctx.settings.runner.default_backoff_schedule_ms,
    );
    let num_threads = metadata.num_threads;
    let previous = ctx.metadata.replace(metadata);

    if previous.num_threads != num_threads {
        let capacity = ctx.settings.queue_capacity_for(num_threads);
        info!(
            partition = %ctx.lease.partition_name,
            from = previous.num_threads,
            to = num_threads,
            queue_capacity = capacity,
            "num_threads changed, resizing pipeline"
        );
        if let Err(e) = ctx.queue.set_capacity(capacity) {
            warn!(error = %e, "Rejected batch queue capacity");
        }
    }

    let partition = &snapshot.partition;
    if let (true, Some(rate)) = (partition.precomputing_done, partition.matching_records_per_minute) {
        let remaining =
            (partition.computed_matching_record_count - partition.backfilled_matching_record_count).max(0);
        if rate > 0 {
            let eta_seconds = (remaining * 60 / rate).max(0) as u64;
            metrics::partition_eta_seconds().record(eta_seconds, &ctx.labels());
        }
    }
}
