//! # Backfill Runner
//!
//! Drives one leased partition from its persisted cursor to completion (or until stopped).
//!
//! ## Stages
//!
//! A runner spawns its stages into a `JoinSet`:
//!
//! - [`batch_queuer`]: asks the Batch Source for the next batch ranges and pushes them into a
//!   [`VariableCapacityChannel`] sized `num_threads * batch_queue_thread_multiplier`
//! - [`batch_precomputer`]: independent estimation-only scan that fills in the totals used for
//!   progress and ETA
//! - [`batch_executor`]: keeps up to `num_threads` Batch Client calls in flight and commits
//!   their results strictly in order
//! - [`lease_keeper`]: polls settings, verifies and extends the lease, persists estimates
//!
//! All stages share one [`RunnerContext`]. Stopping fires a [`StopSignal`]; every stage
//! selects on it, and the channel cancels itself when it fires.
//!
//! ## Failure accounting
//!
//! Source and Client failures from every stage go through [`RunnerContext::record_failure`]
//! together with the failing slot's [`FailureCount`]: the prefetch scan, the precompute scan
//! and each in-flight batch count separately. Consecutive failures step through the run's
//! backoff schedule; one more failure than the schedule has steps pauses the whole run and
//! fails the runner.

pub mod backoff;
pub mod batch_executor;
pub mod batch_precomputer;
pub mod batch_queuer;
pub mod lease_keeper;
pub mod metadata;

use chrono::Duration as ChronoDuration;
use opentelemetry::KeyValue;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::channel::VariableCapacityChannel;
use crate::clock::{SharedClock, SystemClock};
use crate::config::{BackfillConfig, RunnerConfig};
use crate::error::{BackfillError, BatchFailure, FailureKind, Result};
use crate::logging::{log_lease_operation, log_partition_operation};
use crate::metrics;
use crate::models::{Batch, EventLog, PrecomputeProgress, RecordRates};
use crate::rate_counter::RateCounter;
use crate::registry::Connector;
use crate::stop::StopSignal;
use crate::store::BackfillStore;

use backoff::{FailureCount, FailureTracker, FailureVerdict};
use metadata::{BackfillMetadata, MetadataCell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerState {
    Idle,
    Running,
    /// Stopped on request, on pause, or after losing the lease.
    Stopped,
    /// Backoff schedule exhausted (the run was paused) or an unrecoverable store error.
    Failed,
    Complete,
}

impl RunnerState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RunnerState::Stopped | RunnerState::Failed | RunnerState::Complete
        )
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunnerState::Idle => "idle",
            RunnerState::Running => "running",
            RunnerState::Stopped => "stopped",
            RunnerState::Failed => "failed",
            RunnerState::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Shared, first-terminal-state-wins runner state.
#[derive(Debug, Clone)]
struct StateCell(Arc<RwLock<RunnerState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(RwLock::new(RunnerState::Idle)))
    }

    fn get(&self) -> RunnerState {
        *self.0.read()
    }

    fn start(&self) {
        let mut state = self.0.write();
        if *state == RunnerState::Idle {
            *state = RunnerState::Running;
        }
    }

    fn finish(&self, terminal: RunnerState) {
        let mut state = self.0.write();
        if !state.is_finished() {
            *state = terminal;
        }
    }
}

/// Cloneable control surface for a runner that has been moved into a task.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    partition_id: Uuid,
    stop: StopSignal,
    state: StateCell,
}

impl RunnerHandle {
    pub fn partition_id(&self) -> Uuid {
        self.partition_id
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn state(&self) -> RunnerState {
        self.state.get()
    }
}

/// Identity of a won lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedPartition {
    pub partition_id: Uuid,
    pub backfill_run_id: Uuid,
    pub partition_name: String,
    pub lease_token: String,
}

/// Process-wide settings every runner shares.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub runner: RunnerConfig,
    pub lease_duration: Duration,
    pub clock: SharedClock,
}

impl RunnerSettings {
    pub fn from_config(config: &BackfillConfig) -> Self {
        Self {
            runner: config.runner.clone(),
            lease_duration: config.scheduler.lease_duration(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Prefetch queue capacity for `num_threads` concurrent client calls.
    pub fn queue_capacity_for(&self, num_threads: usize) -> usize {
        (num_threads * self.runner.batch_queue_thread_multiplier).max(1)
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&BackfillConfig::default())
    }
}

/// Rate counters and precompute totals waiting for the next lease keeper poll.
#[derive(Debug)]
pub struct ProgressState {
    scanned: RateCounter,
    matching: RateCounter,
    pending_precompute: Option<PrecomputeProgress>,
}

impl ProgressState {
    fn new(clock: SharedClock) -> Self {
        Self {
            scanned: RateCounter::new(Arc::clone(&clock)),
            matching: RateCounter::new(clock),
            pending_precompute: None,
        }
    }

    pub fn record_batch(&mut self, batch: &Batch) {
        self.scanned.add(batch.scanned_record_count);
        self.matching.add(batch.matching_record_count);
    }

    pub fn rates(&mut self) -> RecordRates {
        RecordRates {
            scanned_per_minute: self.scanned.projected_rate(),
            matching_per_minute: self.matching.projected_rate(),
        }
    }
}

/// State shared by every stage of one runner.
pub struct RunnerContext {
    pub lease: LeasedPartition,
    pub connector: Connector,
    pub store: Arc<dyn BackfillStore>,
    pub settings: RunnerSettings,
    pub stop: StopSignal,
    pub metadata: MetadataCell,
    pub failures: FailureTracker,
    pub progress: Mutex<ProgressState>,
    pub queue: VariableCapacityChannel<Batch>,
    state: StateCell,
}

impl fmt::Debug for RunnerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerContext")
            .field("partition_id", &self.lease.partition_id)
            .field("partition_name", &self.lease.partition_name)
            .field("state", &self.state.get())
            .finish()
    }
}

impl RunnerContext {
    pub fn labels(&self) -> [KeyValue; 2] {
        metrics::partition_labels(self.lease.backfill_run_id, &self.lease.partition_name)
    }

    pub fn finish(&self, state: RunnerState) {
        self.state.finish(state);
        self.stop.stop();
    }

    /// Called when a token-checked write is refused.
    pub fn lease_lost(&self, during: &str) {
        warn!(
            partition_id = %self.lease.partition_id,
            partition = %self.lease.partition_name,
            during = %during,
            "Lease superseded by another runner, stopping"
        );
        metrics::leases_lost().add(1, &self.labels());
        log_lease_operation("lost", self.lease.partition_id, "superseded", Some(during));
        self.finish(RunnerState::Stopped);
    }

    /// Best-effort event write; operator history never blocks the pipeline.
    pub async fn log_event(&self, event: EventLog) {
        if let Err(e) = self.store.record_event(&event).await {
            warn!(
                partition_id = %self.lease.partition_id,
                error = %e,
                "Failed to record event log entry"
            );
        }
    }

    /// Count a Source or Client failure of `slot` against the backoff schedule.
    ///
    /// Returns the verdict; on `Exhausted` the run has already been paused and the runner
    /// finished as FAILED.
    pub async fn record_failure(
        &self,
        slot: &mut FailureCount,
        failure: &BatchFailure,
        action: &str,
    ) -> Result<FailureVerdict> {
        let kind = match failure.kind {
            FailureKind::Transport => "transport",
            FailureKind::Application => "application",
        };
        let labels = self.labels();
        metrics::batches_failed().add(
            1,
            &[labels[0].clone(), labels[1].clone(), KeyValue::new("kind", kind)],
        );

        let metadata = self.metadata.load();
        let verdict = self.failures.on_failure(slot, &metadata.backoff_schedule);
        let diagnostic = failure.diagnostic();

        match verdict {
            FailureVerdict::Retry { delay, counted } => {
                warn!(
                    partition = %self.lease.partition_name,
                    action = %action,
                    error = %failure,
                    backoff_ms = delay.as_millis() as u64,
                    counted = counted,
                    "Batch call failed, backing off"
                );
                let message = if counted {
                    format!("error {action}, backing off for {}ms", delay.as_millis())
                } else {
                    format!("error {action}, already backing off")
                };
                self.log_event(EventLog::error(
                    self.lease.backfill_run_id,
                    self.lease.partition_id,
                    message,
                    Some(diagnostic),
                ))
                .await;
            }
            FailureVerdict::Exhausted { failures } => {
                error!(
                    partition = %self.lease.partition_name,
                    action = %action,
                    failures = failures,
                    error = %failure,
                    "Backoff schedule exhausted, pausing backfill"
                );
                let paused = self
                    .store
                    .pause_run(
                        self.lease.backfill_run_id,
                        self.lease.partition_id,
                        &diagnostic,
                    )
                    .await?;
                if paused {
                    metrics::partitions_paused().add(1, &labels);
                    self.log_event(EventLog::error(
                        self.lease.backfill_run_id,
                        self.lease.partition_id,
                        format!("error {action}, paused backfill due to {failures} consecutive errors"),
                        Some(diagnostic),
                    ))
                    .await;
                    log_partition_operation(
                        "pause",
                        self.lease.backfill_run_id,
                        &self.lease.partition_name,
                        "paused",
                        Some("backoff schedule exhausted"),
                    );
                }
                self.finish(RunnerState::Failed);
            }
        }
        Ok(verdict)
    }
}

/// Runs one leased partition. Construct through the lease hunter or directly for tests.
pub struct BackfillRunner {
    lease: LeasedPartition,
    connector: Connector,
    store: Arc<dyn BackfillStore>,
    settings: RunnerSettings,
    stop: StopSignal,
    state: StateCell,
}

impl fmt::Debug for BackfillRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackfillRunner")
            .field("lease", &self.lease)
            .field("state", &self.state.get())
            .finish()
    }
}

impl BackfillRunner {
    pub fn new(
        lease: LeasedPartition,
        connector: Connector,
        store: Arc<dyn BackfillStore>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            lease,
            connector,
            store,
            settings,
            stop: StopSignal::new(),
            state: StateCell::new(),
        }
    }

    pub fn partition_id(&self) -> Uuid {
        self.lease.partition_id
    }

    pub fn lease(&self) -> &LeasedPartition {
        &self.lease
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            partition_id: self.lease.partition_id,
            stop: self.stop.clone(),
            state: self.state.clone(),
        }
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn state(&self) -> RunnerState {
        self.state.get()
    }

    /// Run until the partition completes, fails, loses its lease or is stopped. Releases the
    /// lease on the way out if this runner still holds it.
    #[instrument(skip(self), fields(partition_id = %self.lease.partition_id, partition = %self.lease.partition_name))]
    pub async fn run(self) -> Result<RunnerState> {
        self.state.start();
        let result = self.run_stages().await;

        if let Err(e) = &result {
            error!(error = %e, "Runner stopped on error");
            self.state.finish(RunnerState::Failed);
        }
        self.state.finish(RunnerState::Stopped);
        self.stop.stop();

        match self
            .store
            .release_lease(self.lease.partition_id, &self.lease.lease_token)
            .await
        {
            Ok(true) => log_lease_operation("release", self.lease.partition_id, "released", None),
            Ok(false) => debug!("Lease already gone at shutdown"),
            Err(e) => warn!(error = %e, "Failed to release lease, it will expire"),
        }

        let state = self.state.get();
        info!(state = %state, "🏁 RUNNER: Partition runner finished");
        result.map(|_| state)
    }

    async fn run_stages(&self) -> Result<()> {
        let snapshot = self.store.load_snapshot(self.lease.partition_id).await?;
        if !snapshot.partition.holds_lease(&self.lease.lease_token) {
            warn!("Lease was taken before the runner started");
            return Ok(());
        }
        if !snapshot.is_running() {
            info!(run_state = %snapshot.partition.run_state, "Partition is no longer running");
            return Ok(());
        }

        let metadata = BackfillMetadata::from_snapshot(
            &snapshot,
            &self.settings.runner.default_backoff_schedule_ms,
        );
        let labels = metrics::partition_labels(self.lease.backfill_run_id, &self.lease.partition_name);
        let queue_capacity = self.settings.queue_capacity_for(metadata.num_threads);
        let queue = VariableCapacityChannel::with_size_listener(queue_capacity, move |queued| {
            metrics::prefetch_queue_depth().record(queued as u64, &labels);
        })?;

        info!(
            cursor = ?snapshot.partition.pkey_cursor,
            num_threads = metadata.num_threads,
            queue_capacity = queue_capacity,
            precomputing_done = snapshot.partition.precomputing_done,
            "🚀 RUNNER: Starting partition stages"
        );

        let ctx = Arc::new(RunnerContext {
            lease: self.lease.clone(),
            connector: self.connector.clone(),
            store: Arc::clone(&self.store),
            settings: self.settings.clone(),
            stop: self.stop.clone(),
            metadata: MetadataCell::new(metadata),
            failures: FailureTracker::new(),
            progress: Mutex::new(ProgressState::new(Arc::clone(&self.settings.clock))),
            queue,
            state: self.state.clone(),
        });

        let sender = ctx.queue.upstream();
        let receiver = ctx.queue.proxy(&ctx.stop);

        let mut stages: JoinSet<(&'static str, Result<()>)> = JoinSet::new();
        {
            let ctx = Arc::clone(&ctx);
            let cursor = snapshot.partition.pkey_cursor.clone();
            stages.spawn(async move {
                ("batch_queuer", batch_queuer::run(ctx, sender, cursor).await)
            });
        }
        if !snapshot.partition.precomputing_done {
            let ctx = Arc::clone(&ctx);
            let partition = snapshot.partition.clone();
            stages.spawn(async move {
                ("batch_precomputer", batch_precomputer::run(ctx, partition).await)
            });
        }
        {
            let ctx = Arc::clone(&ctx);
            let partition = snapshot.partition.clone();
            stages.spawn(async move {
                ("batch_executor", batch_executor::run(ctx, receiver, partition).await)
            });
        }
        {
            let ctx = Arc::clone(&ctx);
            stages.spawn(async move { ("lease_keeper", lease_keeper::run(ctx).await) });
        }

        let mut first_error: Option<BackfillError> = None;
        while let Some(joined) = stages.join_next().await {
            match joined {
                Ok((stage, Ok(()))) => debug!(stage = stage, "Stage finished"),
                Ok((stage, Err(e))) => {
                    error!(stage = stage, error = %e, "Stage failed, stopping runner");
                    ctx.stop.stop();
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    error!(error = %join_error, "Stage panicked, stopping runner");
                    ctx.stop.stop();
                    first_error.get_or_insert(BackfillError::InvalidState(format!(
                        "runner stage panicked: {join_error}"
                    )));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Lease expiry for a renewal issued now.
pub(crate) fn lease_expiry(settings: &RunnerSettings) -> chrono::DateTime<chrono::Utc> {
    let duration = ChronoDuration::from_std(settings.lease_duration)
        .unwrap_or_else(|_| ChronoDuration::minutes(5));
    settings.clock.now() + duration
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_first_terminal_state_wins() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), RunnerState::Idle);
        cell.start();
        assert_eq!(cell.get(), RunnerState::Running);
        cell.finish(RunnerState::Failed);
        cell.finish(RunnerState::Stopped);
        assert_eq!(cell.get(), RunnerState::Failed);
    }

    #[test]
    fn test_queue_capacity_scales_with_threads() {
        let settings = RunnerSettings::default();
        assert_eq!(settings.queue_capacity_for(2), 6);
        assert_eq!(settings.queue_capacity_for(0), 1);
    }

    #[test]
    fn test_runner_state_display() {
        assert_eq!(RunnerState::Complete.to_string(), "complete");
        assert!(RunnerState::Stopped.is_finished());
        assert!(!RunnerState::Running.is_finished());
    }
}
