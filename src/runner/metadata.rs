//! Latest-read settings for a runner, swapped whole on every settings poll.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::KeyRange;
use crate::store::PartitionSnapshot;

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillMetadata {
    pub backfill_run_id: Uuid,
    pub backfill_name: String,
    pub partition_name: String,
    pub key_range: KeyRange,
    pub num_threads: usize,
    pub batch_size: i64,
    pub scan_size: i64,
    pub extra_sleep: Duration,
    pub backoff_schedule: Vec<Duration>,
    pub parameters: HashMap<String, String>,
    pub dry_run: bool,
}

impl BackfillMetadata {
    /// Build from a snapshot, using `default_schedule_ms` when the run has no schedule.
    pub fn from_snapshot(snapshot: &PartitionSnapshot, default_schedule_ms: &[u64]) -> Self {
        let run = &snapshot.run;
        let schedule_ms: Vec<u64> = match &run.backoff_schedule {
            Some(schedule) if !schedule.is_empty() => run.effective_backoff_schedule(),
            _ => default_schedule_ms.to_vec(),
        };

        Self {
            backfill_run_id: run.id,
            backfill_name: run.name.clone(),
            partition_name: snapshot.partition.partition_name.clone(),
            key_range: snapshot.partition.key_range.clone(),
            num_threads: usize::try_from(run.num_threads).unwrap_or(1).max(1),
            batch_size: run.batch_size,
            scan_size: run.scan_size,
            extra_sleep: Duration::from_millis(u64::try_from(run.extra_sleep_ms).unwrap_or(0)),
            backoff_schedule: schedule_ms.into_iter().map(Duration::from_millis).collect(),
            parameters: run.parameters.clone(),
            dry_run: run.dry_run,
        }
    }
}

#[derive(Debug)]
pub struct MetadataCell {
    current: RwLock<Arc<BackfillMetadata>>,
}

impl MetadataCell {
    pub fn new(metadata: BackfillMetadata) -> Self {
        Self {
            current: RwLock::new(Arc::new(metadata)),
        }
    }

    pub fn load(&self) -> Arc<BackfillMetadata> {
        Arc::clone(&self.current.read())
    }

    /// Swap in `metadata`, returning the previous value.
    pub fn replace(&self, metadata: BackfillMetadata) -> Arc<BackfillMetadata> {
        std::mem::replace(&mut *self.current.write(), Arc::new(metadata))
    }
}
