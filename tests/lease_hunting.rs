//! Lease contention between hunters sharing one store.

mod common;

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

use backfill_core::config::SchedulerConfig;
use backfill_core::models::{BackfillRun, BackfillState, KeyRange, Lease, RunPartition};
use backfill_core::registry::ConnectorRegistry;
use backfill_core::runner::RunnerSettings;
use backfill_core::scheduler::LeaseHunter;
use backfill_core::store::{BackfillStore, InMemoryBackfillStore};

use common::{static_connector, CONNECTOR};

async fn seed_runs(store: &InMemoryBackfillStore, runs: usize, partitions_per_run: usize) {
    for r in 0..runs {
        let mut run = BackfillRun::new(format!("run-{r}"), CONNECTOR, "operator");
        run.state = BackfillState::Running;
        let partitions: Vec<RunPartition> = (0..partitions_per_run)
            .map(|p| {
                let mut partition =
                    RunPartition::new(run.id, format!("shard-{p}"), KeyRange::new("0", "10"));
                partition.run_state = BackfillState::Running;
                partition
            })
            .collect();
        store.insert_run(&run, &partitions).await.unwrap();
    }
}

fn hunter(store: &InMemoryBackfillStore, max_leases_per_hunt: usize) -> LeaseHunter {
    let (_, _, connector) = static_connector(10);
    let registry = ConnectorRegistry::new();
    registry.register(CONNECTOR, connector);
    LeaseHunter::new(
        Arc::new(store.clone()),
        Arc::new(registry),
        RunnerSettings::default(),
        &SchedulerConfig {
            max_leases_per_hunt,
            ..SchedulerConfig::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hunts_never_double_claim() {
    let store = InMemoryBackfillStore::new();
    seed_runs(&store, 5, 2).await;

    let mut hunts = Vec::new();
    for _ in 0..16 {
        let hunter = hunter(&store, 5);
        hunts.push(tokio::spawn(async move { hunter.hunt().await }));
    }

    let mut claimed = Vec::new();
    for hunt in hunts {
        for runner in hunt.await.unwrap().unwrap() {
            claimed.push((runner.partition_id(), runner.lease().lease_token.clone()));
        }
    }

    let unique: HashSet<_> = claimed.iter().map(|(id, _)| *id).collect();
    assert_eq!(unique.len(), claimed.len(), "a partition was claimed twice");
    assert_eq!(claimed.len(), 10);

    for (partition_id, token) in &claimed {
        let partition = store.partition(*partition_id).unwrap();
        assert!(partition.holds_lease(token));
    }
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_with_new_token() {
    let store = InMemoryBackfillStore::new();
    seed_runs(&store, 1, 1).await;

    let candidate = store
        .claimable_partitions(Utc::now())
        .await
        .unwrap()
        .remove(0);
    let stale = Lease {
        token: "crashed-worker".to_string(),
        expires_at: Utc::now() - chrono::Duration::seconds(1),
    };
    assert!(store
        .try_claim_lease(candidate.partition_id, None, &stale)
        .await
        .unwrap());

    let runners = hunter(&store, 1).hunt().await.unwrap();
    assert_eq!(runners.len(), 1);
    let token = &runners[0].lease().lease_token;
    assert_ne!(token, "crashed-worker");
    assert!(store
        .partition(candidate.partition_id)
        .unwrap()
        .holds_lease(token));
}

#[tokio::test]
async fn test_live_lease_and_paused_runs_are_not_claimable() {
    let store = InMemoryBackfillStore::new();
    seed_runs(&store, 2, 1).await;

    let first = hunter(&store, 5).hunt().await.unwrap();
    assert_eq!(first.len(), 2);

    let run_id = first[0].lease().backfill_run_id;
    store
        .update_run_state(run_id, BackfillState::Paused)
        .await
        .unwrap();
    for runner in &first {
        store
            .release_lease(runner.partition_id(), &runner.lease().lease_token)
            .await
            .unwrap();
    }

    let second = hunter(&store, 5).hunt().await.unwrap();
    assert_eq!(second.len(), 1);
    assert_ne!(second[0].lease().backfill_run_id, run_id);
    assert!(hunter(&store, 5).hunt().await.unwrap().is_empty());
}
