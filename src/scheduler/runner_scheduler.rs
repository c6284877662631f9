//! # Runner Scheduler
//!
//! Long-running loop of a worker process: hunt for leases, spawn a [`BackfillRunner`] per win,
//! sleep `hunt_interval + jitter`, repeat. Live runners are tracked by partition id so the
//! scheduler can stop them on shutdown and report how many are active.
//!
//! Shutdown stops every runner, then waits up to `shutdown_timeout` for them to release their
//! leases before aborting the stragglers. An aborted runner's lease simply expires.

use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::lease_hunter::LeaseHunter;
use crate::config::{BackfillConfig, SchedulerConfig};
use crate::error::Result;
use crate::metrics;
use crate::registry::ConnectorRegistry;
use crate::runner::{RunnerHandle, RunnerSettings, RunnerState};
use crate::stop::StopSignal;
use crate::store::BackfillStore;

type RunnerOutcome = (Uuid, Result<RunnerState>);

pub struct RunnerScheduler {
    hunter: LeaseHunter,
    config: SchedulerConfig,
    runners: Arc<DashMap<Uuid, RunnerHandle>>,
}

impl std::fmt::Debug for RunnerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerScheduler")
            .field("hunter", &self.hunter)
            .field("active_runners", &self.runners.len())
            .finish()
    }
}

impl RunnerScheduler {
    pub fn new(hunter: LeaseHunter, config: SchedulerConfig) -> Self {
        Self {
            hunter,
            config,
            runners: Arc::new(DashMap::new()),
        }
    }

    /// Scheduler with the system clock and settings taken from `config`.
    pub fn from_config(
        store: Arc<dyn BackfillStore>,
        registry: Arc<ConnectorRegistry>,
        config: &BackfillConfig,
    ) -> Self {
        let hunter = LeaseHunter::new(
            store,
            registry,
            RunnerSettings::from_config(config),
            &config.scheduler,
        );
        Self::new(hunter, config.scheduler.clone())
    }

    pub fn active_runners(&self) -> usize {
        self.runners.len()
    }

    /// Ask every live runner to stop. Does not wait.
    pub fn stop_all(&self) {
        for entry in self.runners.iter() {
            entry.value().stop();
        }
    }

    /// Hunt and spawn until `shutdown` fires, then stop and drain every runner.
    #[instrument(skip(self, shutdown))]
    pub async fn run_until_stopped(&self, shutdown: StopSignal) -> Result<()> {
        let mut tasks: JoinSet<RunnerOutcome> = JoinSet::new();
        info!(
            hunt_interval_ms = self.config.hunt_interval_ms,
            max_leases_per_hunt = self.config.max_leases_per_hunt,
            "🚀 SCHEDULER: Starting lease hunting"
        );

        while !shutdown.is_stopped() {
            self.hunt_and_spawn(&mut tasks).await;

            let deadline = Instant::now() + self.next_delay();
            loop {
                tokio::select! {
                    _ = shutdown.stopped() => break,
                    _ = tokio::time::sleep_until(deadline) => break,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        self.reap(joined);
                    }
                }
            }
        }

        self.shutdown(tasks).await;
        Ok(())
    }

    async fn hunt_and_spawn(&self, tasks: &mut JoinSet<RunnerOutcome>) {
        let runners = match self.hunter.hunt().await {
            Ok(runners) => runners,
            Err(e) => {
                warn!(error = %e, "Lease hunt failed, retrying next interval");
                return;
            }
        };

        for runner in runners {
            let partition_id = runner.partition_id();
            self.runners.insert(partition_id, runner.handle());
            tasks.spawn(async move { (partition_id, runner.run().await) });
            debug!(partition_id = %partition_id, "Spawned partition runner");
        }
        self.record_active();
    }

    fn reap(&self, joined: std::result::Result<RunnerOutcome, JoinError>) {
        match joined {
            Ok((partition_id, outcome)) => {
                self.runners.remove(&partition_id);
                match outcome {
                    Ok(state) => {
                        info!(partition_id = %partition_id, state = %state, "Runner finished")
                    }
                    Err(e) => {
                        error!(partition_id = %partition_id, error = %e, "Runner failed")
                    }
                }
            }
            Err(join_error) => {
                error!(error = %join_error, "Runner task panicked");
                // The panicked runner's id is lost with its output; prune finished handles.
                self.runners.retain(|_, handle| !handle.state().is_finished());
            }
        }
        self.record_active();
    }

    async fn shutdown(&self, mut tasks: JoinSet<RunnerOutcome>) {
        info!(active = tasks.len(), "🛑 SCHEDULER: Stopping partition runners");
        self.stop_all();

        let drained = tokio::time::timeout(self.config.shutdown_timeout(), async {
            while let Some(joined) = tasks.join_next().await {
                self.reap(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "Runners did not stop within shutdown timeout, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            self.runners.clear();
            self.record_active();
        }
        info!("SCHEDULER: Shutdown complete");
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.config.hunt_jitter_ms;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.hunt_interval() + Duration::from_millis(jitter)
    }

    fn record_active(&self) {
        metrics::active_runners().record(self.runners.len() as u64, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackfillStore;

    fn scheduler(config: SchedulerConfig) -> RunnerScheduler {
        let store: Arc<dyn BackfillStore> = Arc::new(InMemoryBackfillStore::new());
        let hunter = LeaseHunter::new(
            store,
            Arc::new(ConnectorRegistry::new()),
            RunnerSettings::default(),
            &config,
        );
        RunnerScheduler::new(hunter, config)
    }

    #[test]
    fn test_next_delay_stays_within_jitter() {
        let scheduler = scheduler(SchedulerConfig {
            hunt_interval_ms: 1_000,
            hunt_jitter_ms: 250,
            ..SchedulerConfig::default()
        });
        for _ in 0..50 {
            let delay = scheduler.next_delay();
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(1_250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_stopped_returns_on_shutdown() {
        let scheduler = scheduler(SchedulerConfig::default());
        let shutdown = StopSignal::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.stop();
        });

        scheduler.run_until_stopped(shutdown).await.unwrap();
        assert_eq!(scheduler.active_runners(), 0);
    }
}
