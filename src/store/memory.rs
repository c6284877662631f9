//! In-memory [`BackfillStore`]. One mutex guards all state, so each method is atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    BackfillStore, ClaimCandidate, LeaseCheck, LeaseRenewal, PartitionCompletion,
    PartitionSnapshot, RunSettings,
};
use crate::error::{BackfillError, Result};
use crate::models::{
    BackfillRun, BackfillState, EventKind, EventLog, ExecutionProgress, Lease,
    PrecomputeProgress, RunPartition,
};

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<Uuid, BackfillRun>,
    partitions: HashMap<Uuid, RunPartition>,
    events: Vec<EventLog>,
}

impl Inner {
    fn snapshot(&self, partition_id: Uuid) -> Result<PartitionSnapshot> {
        let partition = self
            .partitions
            .get(&partition_id)
            .ok_or_else(|| BackfillError::partition_not_found(partition_id))?;
        let run = self
            .runs
            .get(&partition.backfill_run_id)
            .ok_or_else(|| BackfillError::run_not_found(partition.backfill_run_id))?;
        Ok(PartitionSnapshot {
            partition: partition.clone(),
            run: run.clone(),
        })
    }

    /// Partition whose stored token is `token`.
    fn leased_partition(&mut self, partition_id: Uuid, token: &str) -> Option<&mut RunPartition> {
        self.partitions
            .get_mut(&partition_id)
            .filter(|partition| partition.holds_lease(token))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBackfillStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBackfillStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, partition_id: Uuid) -> Option<RunPartition> {
        self.inner.lock().partitions.get(&partition_id).cloned()
    }

    pub fn run(&self, run_id: Uuid) -> Option<BackfillRun> {
        self.inner.lock().runs.get(&run_id).cloned()
    }

    pub fn events(&self) -> Vec<EventLog> {
        self.inner.lock().events.clone()
    }
}

#[async_trait]
impl BackfillStore for InMemoryBackfillStore {
    async fn claimable_partitions(&self, now: DateTime<Utc>) -> Result<Vec<ClaimCandidate>> {
        let inner = self.inner.lock();
        let candidates = inner
            .partitions
            .values()
            .filter(|partition| {
                partition.run_state == BackfillState::Running && partition.lease_available(now)
            })
            .filter_map(|partition| {
                let run = inner.runs.get(&partition.backfill_run_id)?;
                (run.state == BackfillState::Running).then(|| ClaimCandidate {
                    partition_id: partition.id,
                    backfill_run_id: run.id,
                    partition_name: partition.partition_name.clone(),
                    connector: run.connector.clone(),
                    lease: partition.lease.clone(),
                })
            })
            .collect();
        Ok(candidates)
    }

    async fn try_claim_lease(
        &self,
        partition_id: Uuid,
        expected: Option<&Lease>,
        new_lease: &Lease,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let partition = inner
            .partitions
            .get_mut(&partition_id)
            .ok_or_else(|| BackfillError::partition_not_found(partition_id))?;
        if partition.lease.as_ref() != expected {
            return Ok(false);
        }
        partition.lease = Some(new_lease.clone());
        partition.updated_at = Utc::now();
        Ok(true)
    }

    async fn load_snapshot(&self, partition_id: Uuid) -> Result<PartitionSnapshot> {
        self.inner.lock().snapshot(partition_id)
    }

    async fn refresh_lease(
        &self,
        partition_id: Uuid,
        token: &str,
        renewal: &LeaseRenewal,
    ) -> Result<LeaseCheck> {
        let mut inner = self.inner.lock();
        let snapshot = match inner.snapshot(partition_id) {
            Ok(snapshot) if snapshot.partition.holds_lease(token) => snapshot,
            Ok(_) | Err(BackfillError::NotFound { .. }) => return Ok(LeaseCheck::Lost),
            Err(e) => return Err(e),
        };
        if !snapshot.is_running() {
            return Ok(LeaseCheck::Stopped(snapshot));
        }

        let Some(partition) = inner.leased_partition(partition_id, token) else {
            return Ok(LeaseCheck::Lost);
        };
        if let Some(lease) = partition.lease.as_mut() {
            lease.expires_at = renewal.expires_at;
        }
        if let Some(progress) = renewal.precompute.as_ref().filter(|_| !partition.precomputing_done) {
            partition.apply_precompute_progress(progress);
        }
        if let Some(rates) = renewal.rates {
            partition.apply_rates(rates);
        }
        partition.updated_at = Utc::now();

        Ok(LeaseCheck::Held(inner.snapshot(partition_id)?))
    }

    async fn save_progress(
        &self,
        partition_id: Uuid,
        token: &str,
        progress: &ExecutionProgress,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(partition) = inner.leased_partition(partition_id, token) else {
            return Ok(false);
        };
        partition.apply_execution_progress(progress);
        partition.updated_at = Utc::now();
        Ok(true)
    }

    async fn save_precompute_progress(
        &self,
        partition_id: Uuid,
        token: &str,
        progress: &PrecomputeProgress,
        done: bool,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(partition) = inner.leased_partition(partition_id, token) else {
            return Ok(false);
        };
        partition.apply_precompute_progress(progress);
        partition.precomputing_done = partition.precomputing_done || done;
        partition.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete_partition(
        &self,
        partition_id: Uuid,
        token: &str,
        progress: &ExecutionProgress,
    ) -> Result<PartitionCompletion> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let Some(partition) = inner.leased_partition(partition_id, token) else {
            return Ok(PartitionCompletion::default());
        };
        partition.apply_execution_progress(progress);
        partition.run_state = BackfillState::Complete;
        partition.lease = None;
        partition.updated_at = now;
        let run_id = partition.backfill_run_id;

        let all_complete = inner
            .partitions
            .values()
            .filter(|p| p.backfill_run_id == run_id)
            .all(|p| p.run_state == BackfillState::Complete);

        let mut run_completed = false;
        if all_complete {
            if let Some(run) = inner.runs.get_mut(&run_id) {
                if run.state != BackfillState::Complete {
                    run.state = BackfillState::Complete;
                    run.updated_at = now;
                    run_completed = true;
                }
            }
        }

        Ok(PartitionCompletion {
            partition_completed: true,
            run_completed,
        })
    }

    async fn pause_run(&self, run_id: Uuid, partition_id: Uuid, last_error: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| BackfillError::run_not_found(run_id))?;
        if run.state != BackfillState::Running {
            return Ok(false);
        }
        run.state = BackfillState::Paused;
        run.updated_at = now;

        for partition in inner
            .partitions
            .values_mut()
            .filter(|p| p.backfill_run_id == run_id && p.run_state != BackfillState::Complete)
        {
            partition.run_state = BackfillState::Paused;
            partition.updated_at = now;
            if partition.id == partition_id {
                partition.last_error = Some(last_error.to_string());
            }
        }
        Ok(true)
    }

    async fn release_lease(&self, partition_id: Uuid, token: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(partition) = inner.leased_partition(partition_id, token) else {
            return Ok(false);
        };
        partition.lease = None;
        partition.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_event(&self, event: &EventLog) -> Result<()> {
        self.inner.lock().events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, run_id: Uuid) -> Result<Vec<EventLog>> {
        Ok(self
            .inner
            .lock()
            .events
            .iter()
            .filter(|event| event.backfill_run_id == run_id)
            .cloned()
            .collect())
    }

    async fn insert_run(&self, run: &BackfillRun, partitions: &[RunPartition]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.runs.contains_key(&run.id) {
            return Err(BackfillError::InvalidState(format!(
                "backfill run {} already exists",
                run.id
            )));
        }
        inner.runs.insert(run.id, run.clone());
        for partition in partitions {
            inner.partitions.insert(partition.id, partition.clone());
        }
        Ok(())
    }

    async fn update_run_state(&self, run_id: Uuid, state: BackfillState) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| BackfillError::run_not_found(run_id))?;
        if run.state.is_terminal() {
            return Err(BackfillError::InvalidState(format!(
                "backfill run {run_id} is {} and cannot become {state}",
                run.state
            )));
        }
        let previous = run.state;
        run.state = state;
        run.updated_at = now;
        if state == BackfillState::Running && run.approved_at.is_none() {
            run.approved_at = Some(now);
        }

        for partition in inner
            .partitions
            .values_mut()
            .filter(|p| p.backfill_run_id == run_id && p.run_state != BackfillState::Complete)
        {
            partition.run_state = state;
            partition.updated_at = now;
            if state == BackfillState::Running {
                partition.last_error = None;
            }
        }

        inner.events.push(EventLog::state_change(
            run_id,
            None,
            format!("run state changed from {previous} to {state}"),
        ));
        Ok(())
    }

    async fn update_run_settings(&self, run_id: Uuid, settings: &RunSettings) -> Result<()> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| BackfillError::run_not_found(run_id))?;
        settings.apply(run);
        run.updated_at = Utc::now();

        let mut event = EventLog::new(
            run_id,
            None,
            EventKind::ConfigChange,
            "run settings updated",
        );
        event.extra_data = Some(serde_json::to_string(settings)?);
        inner.events.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KeyRange, RecordRates};
    use chrono::Duration;

    async fn running_store(partitions: usize) -> (InMemoryBackfillStore, BackfillRun, Vec<Uuid>) {
        let store = InMemoryBackfillStore::new();
        let run = BackfillRun::new("copy_users", "static", "operator");
        let parts: Vec<RunPartition> = (0..partitions)
            .map(|i| RunPartition::new(run.id, i.to_string(), KeyRange::new("0", "100")))
            .collect();
        let ids = parts.iter().map(|p| p.id).collect();
        store.insert_run(&run, &parts).await.unwrap();
        store
            .update_run_state(run.id, BackfillState::Running)
            .await
            .unwrap();
        (store, run, ids)
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_set() {
        let (store, _, ids) = running_store(1).await;
        let now = Utc::now();
        let first = Lease::issue(now, Duration::minutes(5));
        let second = Lease::issue(now, Duration::minutes(5));

        assert!(store.try_claim_lease(ids[0], None, &first).await.unwrap());
        assert!(!store.try_claim_lease(ids[0], None, &second).await.unwrap());
        assert!(store.claimable_partitions(now).await.unwrap().is_empty());

        let later = now + Duration::minutes(10);
        let candidates = store.claimable_partitions(later).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].lease.as_ref(), Some(&first));
        assert!(store
            .try_claim_lease(ids[0], Some(&first), &second)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_paused_runs_are_not_claimable() {
        let (store, run, _) = running_store(2).await;
        store
            .update_run_state(run.id, BackfillState::Paused)
            .await
            .unwrap();
        assert!(store.claimable_partitions(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_checked_writes() {
        let (store, _, ids) = running_store(1).await;
        let lease = Lease::issue(Utc::now(), Duration::minutes(5));
        store.try_claim_lease(ids[0], None, &lease).await.unwrap();

        let progress = ExecutionProgress {
            pkey_cursor: Some("10".into()),
            backfilled_scanned_record_count: 10,
            backfilled_matching_record_count: 10,
            rates: None,
        };
        assert!(!store.save_progress(ids[0], "stale", &progress).await.unwrap());
        assert!(store
            .save_progress(ids[0], &lease.token, &progress)
            .await
            .unwrap());
        assert_eq!(
            store.partition(ids[0]).unwrap().pkey_cursor,
            Some("10".into())
        );
        assert!(!store.release_lease(ids[0], "stale").await.unwrap());
        assert!(store.release_lease(ids[0], &lease.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_extends_and_detects_loss() {
        let (store, run, ids) = running_store(1).await;
        let now = Utc::now();
        let lease = Lease::issue(now, Duration::minutes(5));
        store.try_claim_lease(ids[0], None, &lease).await.unwrap();

        let renewal = LeaseRenewal {
            expires_at: now + Duration::minutes(10),
            precompute: None,
            rates: Some(RecordRates {
                scanned_per_minute: 600,
                matching_per_minute: 60,
            }),
        };
        match store.refresh_lease(ids[0], &lease.token, &renewal).await.unwrap() {
            LeaseCheck::Held(snapshot) => {
                assert_eq!(
                    snapshot.partition.lease.unwrap().expires_at,
                    now + Duration::minutes(10)
                );
                assert_eq!(snapshot.partition.scanned_records_per_minute, Some(600));
            }
            other => panic!("expected held lease, got {other:?}"),
        }

        assert_eq!(
            store.refresh_lease(ids[0], "other", &renewal).await.unwrap(),
            LeaseCheck::Lost
        );

        store
            .update_run_state(run.id, BackfillState::Paused)
            .await
            .unwrap();
        assert!(matches!(
            store.refresh_lease(ids[0], &lease.token, &renewal).await.unwrap(),
            LeaseCheck::Stopped(_)
        ));
    }

    #[tokio::test]
    async fn test_run_completes_with_last_partition() {
        let (store, run, ids) = running_store(2).await;
        let progress = ExecutionProgress {
            pkey_cursor: Some("100".into()),
            backfilled_scanned_record_count: 100,
            backfilled_matching_record_count: 100,
            rates: None,
        };
        let mut completions = Vec::new();
        for id in &ids {
            let lease = Lease::issue(Utc::now(), Duration::minutes(5));
            store.try_claim_lease(*id, None, &lease).await.unwrap();
            completions.push(
                store
                    .complete_partition(*id, &lease.token, &progress)
                    .await
                    .unwrap(),
            );
        }
        assert!(completions[0].partition_completed && !completions[0].run_completed);
        assert!(completions[1].run_completed);
        assert_eq!(store.run(run.id).unwrap().state, BackfillState::Complete);
        assert!(store.partition(ids[0]).unwrap().lease.is_none());
    }

    #[tokio::test]
    async fn test_pause_and_resume_clears_last_error() {
        let (store, run, ids) = running_store(2).await;
        assert!(store.pause_run(run.id, ids[0], "boom").await.unwrap());
        assert!(!store.pause_run(run.id, ids[0], "boom").await.unwrap());
        assert_eq!(store.partition(ids[0]).unwrap().last_error.as_deref(), Some("boom"));
        assert_eq!(store.partition(ids[1]).unwrap().run_state, BackfillState::Paused);

        store
            .update_run_state(run.id, BackfillState::Running)
            .await
            .unwrap();
        let partition = store.partition(ids[0]).unwrap();
        assert_eq!(partition.run_state, BackfillState::Running);
        assert!(partition.last_error.is_none());
    }

    #[tokio::test]
    async fn test_settings_change_is_logged() {
        let (store, run, _) = running_store(1).await;
        store
            .update_run_settings(
                run.id,
                &RunSettings {
                    num_threads: Some(4),
                    ..RunSettings::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(store.run(run.id).unwrap().num_threads, 4);
        let events = store.list_events(run.id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::ConfigChange));
    }
}
