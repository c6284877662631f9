//! # Lease Hunter
//!
//! Finds claimable partitions and takes their leases with a compare-and-set on the lease
//! columns, so any number of workers can hunt against the same store without coordination.
//!
//! ## Claim rules
//!
//! - a partition is claimable when its run and its own state are RUNNING and its lease is
//!   unset or expired
//! - candidates are shuffled so workers polling at the same moment spread across partitions
//! - at most one partition per run, and at most `max_leases_per_hunt` in total, per hunt
//! - a claim only succeeds if the stored lease still equals the one observed; losing that race
//!   is routine and not an error
//! - a store error on one claim skips that partition; leases already won in the same hunt are
//!   still handed out
//!
//! ## Usage
//!
//! ```rust,no_run
//! use backfill_core::scheduler::LeaseHunter;
//!
//! # async fn example(hunter: LeaseHunter) -> backfill_core::Result<()> {
//! for runner in hunter.hunt().await? {
//!     tokio::spawn(runner.run());
//! }
//! # Ok(())
//! # }
//! ```

use chrono::Duration as ChronoDuration;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::logging::log_lease_operation;
use crate::metrics;
use crate::models::Lease;
use crate::registry::ConnectorRegistry;
use crate::runner::{BackfillRunner, LeasedPartition, RunnerSettings};
use crate::store::{BackfillStore, ClaimCandidate};

/// Claims partitions and turns each win into a ready-to-run [`BackfillRunner`].
#[derive(Clone)]
pub struct LeaseHunter {
    store: Arc<dyn BackfillStore>,
    registry: Arc<ConnectorRegistry>,
    settings: RunnerSettings,
    max_leases_per_hunt: usize,
}

impl std::fmt::Debug for LeaseHunter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHunter")
            .field("connectors", &self.registry.names())
            .field("lease_duration", &self.settings.lease_duration)
            .field("max_leases_per_hunt", &self.max_leases_per_hunt)
            .finish()
    }
}

impl LeaseHunter {
    pub fn new(
        store: Arc<dyn BackfillStore>,
        registry: Arc<ConnectorRegistry>,
        settings: RunnerSettings,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            max_leases_per_hunt: config.max_leases_per_hunt.max(1),
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Claim up to `max_leases_per_hunt` partitions, at most one per run.
    #[instrument(skip(self))]
    pub async fn hunt(&self) -> Result<Vec<BackfillRunner>> {
        let now = self.settings.clock.now();
        let mut candidates = self.store.claimable_partitions(now).await?;
        if candidates.is_empty() {
            debug!("No claimable partitions");
            return Ok(Vec::new());
        }
        candidates.shuffle(&mut rand::thread_rng());

        let duration = ChronoDuration::from_std(self.settings.lease_duration)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));
        let mut seen_runs = HashSet::new();
        let mut runners = Vec::new();

        for candidate in candidates {
            if runners.len() >= self.max_leases_per_hunt {
                break;
            }
            if !seen_runs.insert(candidate.backfill_run_id) {
                continue;
            }

            let lease = Lease::issue(now, duration);
            let claimed = match self
                .store
                .try_claim_lease(candidate.partition_id, candidate.lease.as_ref(), &lease)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(
                        partition_id = %candidate.partition_id,
                        partition = %candidate.partition_name,
                        error = %e,
                        "Lease claim failed, skipping partition"
                    );
                    continue;
                }
            };
            if !claimed {
                debug!(
                    partition_id = %candidate.partition_id,
                    partition = %candidate.partition_name,
                    "Lost lease race, skipping partition"
                );
                continue;
            }

            if let Some(runner) = self.build_runner(&candidate, lease).await {
                runners.push(runner);
            }
        }

        if !runners.is_empty() {
            info!(claimed = runners.len(), "🎯 HUNTER: Claimed partition leases");
        }
        Ok(runners)
    }

    async fn build_runner(
        &self,
        candidate: &ClaimCandidate,
        lease: Lease,
    ) -> Option<BackfillRunner> {
        let connector = match self.registry.resolve(&candidate.connector) {
            Ok(connector) => connector,
            Err(e) => {
                warn!(
                    partition_id = %candidate.partition_id,
                    connector = %candidate.connector,
                    error = %e,
                    "Connector not registered on this worker, releasing lease"
                );
                if let Err(e) = self
                    .store
                    .release_lease(candidate.partition_id, &lease.token)
                    .await
                {
                    warn!(
                        partition_id = %candidate.partition_id,
                        error = %e,
                        "Failed to release unusable lease, it will expire"
                    );
                }
                return None;
            }
        };

        metrics::leases_acquired().add(
            1,
            &metrics::partition_labels(candidate.backfill_run_id, &candidate.partition_name),
        );
        log_lease_operation(
            "acquire",
            candidate.partition_id,
            "acquired",
            Some(&candidate.partition_name),
        );

        let leased = LeasedPartition {
            partition_id: candidate.partition_id,
            backfill_run_id: candidate.backfill_run_id,
            partition_name: candidate.partition_name.clone(),
            lease_token: lease.token,
        };
        Some(BackfillRunner::new(
            leased,
            connector,
            Arc::clone(&self.store),
            self.settings.clone(),
        ))
    }
}
