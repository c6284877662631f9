//! # PostgreSQL Backfill Store
//!
//! [`BackfillStore`] over the tables in `migrations/0001_backfill.sql`.
//!
//! Lease claims are a single conditional `UPDATE` comparing the observed token and expiry
//! with `IS NOT DISTINCT FROM`, so two hunters racing for the same partition can never both
//! win. Runner writes compare the token the same way. Multi-statement operations run in one
//! transaction with the partition row locked `FOR UPDATE`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::HashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    BackfillStore, ClaimCandidate, LeaseCheck, LeaseRenewal, PartitionCompletion,
    PartitionSnapshot, RunSettings,
};
use crate::error::{BackfillError, Result};
use crate::models::{
    BackfillRun, BackfillState, EventKind, EventLog, ExecutionProgress, KeyRange, Lease,
    PrecomputeProgress, PrimaryKey, RunPartition,
};

const PARTITION_COLUMNS: &str = r#"
    id, backfill_run_id, partition_name, range_start, range_end, pkey_cursor,
    precomputing_pkey_cursor, precomputing_done, lease_token, lease_expires_at, run_state,
    computed_scanned_record_count, computed_matching_record_count,
    backfilled_scanned_record_count, backfilled_matching_record_count,
    scanned_records_per_minute, matching_records_per_minute, last_error, created_at, updated_at
"#;

const RUN_COLUMNS: &str = r#"
    id, name, connector, state, scan_size, batch_size, num_threads, backoff_schedule,
    extra_sleep_ms, dry_run, parameters, created_by, created_at, updated_at, approved_at
"#;

#[derive(Debug, FromRow)]
struct RunRow {
    id: Uuid,
    name: String,
    connector: String,
    state: String,
    scan_size: i64,
    batch_size: i64,
    num_threads: i32,
    backoff_schedule: Option<Vec<i64>>,
    extra_sleep_ms: i64,
    dry_run: bool,
    parameters: Json<HashMap<String, String>>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    approved_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for BackfillRun {
    type Error = BackfillError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(BackfillRun {
            id: row.id,
            name: row.name,
            connector: row.connector,
            state: row.state.parse()?,
            scan_size: row.scan_size,
            batch_size: row.batch_size,
            num_threads: row.num_threads,
            backoff_schedule: row.backoff_schedule,
            extra_sleep_ms: row.extra_sleep_ms,
            dry_run: row.dry_run,
            parameters: row.parameters.0,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            approved_at: row.approved_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PartitionRow {
    id: Uuid,
    backfill_run_id: Uuid,
    partition_name: String,
    range_start: Option<Vec<u8>>,
    range_end: Option<Vec<u8>>,
    pkey_cursor: Option<Vec<u8>>,
    precomputing_pkey_cursor: Option<Vec<u8>>,
    precomputing_done: bool,
    lease_token: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    run_state: String,
    computed_scanned_record_count: i64,
    computed_matching_record_count: i64,
    backfilled_scanned_record_count: i64,
    backfilled_matching_record_count: i64,
    scanned_records_per_minute: Option<i64>,
    matching_records_per_minute: Option<i64>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn lease_from_columns(token: Option<String>, expires_at: Option<DateTime<Utc>>) -> Option<Lease> {
    match (token, expires_at) {
        (Some(token), Some(expires_at)) => Some(Lease { token, expires_at }),
        _ => None,
    }
}

impl TryFrom<PartitionRow> for RunPartition {
    type Error = BackfillError;

    fn try_from(row: PartitionRow) -> Result<Self> {
        Ok(RunPartition {
            id: row.id,
            backfill_run_id: row.backfill_run_id,
            partition_name: row.partition_name,
            key_range: KeyRange {
                start: row.range_start.map(PrimaryKey::new),
                end: row.range_end.map(PrimaryKey::new),
            },
            pkey_cursor: row.pkey_cursor.map(PrimaryKey::new),
            precomputing_pkey_cursor: row.precomputing_pkey_cursor.map(PrimaryKey::new),
            precomputing_done: row.precomputing_done,
            lease: lease_from_columns(row.lease_token, row.lease_expires_at),
            run_state: row.run_state.parse()?,
            computed_scanned_record_count: row.computed_scanned_record_count,
            computed_matching_record_count: row.computed_matching_record_count,
            backfilled_scanned_record_count: row.backfilled_scanned_record_count,
            backfilled_matching_record_count: row.backfilled_matching_record_count,
            scanned_records_per_minute: row.scanned_records_per_minute,
            matching_records_per_minute: row.matching_records_per_minute,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    backfill_run_id: Uuid,
    partition_id: Option<Uuid>,
    kind: String,
    message: String,
    extra_data: Option<String>,
    occurred_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventLog {
    type Error = BackfillError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(EventLog {
            id: row.id,
            backfill_run_id: row.backfill_run_id,
            partition_id: row.partition_id,
            kind: row.kind.parse::<EventKind>()?,
            message: row.message,
            extra_data: row.extra_data,
            occurred_at: row.occurred_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CandidateRow {
    id: Uuid,
    backfill_run_id: Uuid,
    partition_name: String,
    connector: String,
    lease_token: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
}

fn key_bytes(key: Option<&PrimaryKey>) -> Option<Vec<u8>> {
    key.map(|key| key.as_bytes().to_vec())
}

#[derive(Debug, Clone)]
pub struct PgBackfillStore {
    pool: PgPool,
}

impl PgBackfillStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_partition(
        tx: &mut Transaction<'_, Postgres>,
        partition_id: Uuid,
        for_update: bool,
    ) -> Result<Option<RunPartition>> {
        let lock = if for_update { "FOR UPDATE" } else { "" };
        let query = format!("SELECT {PARTITION_COLUMNS} FROM run_partitions WHERE id = $1 {lock}");
        sqlx::query_as::<_, PartitionRow>(&query)
            .bind(partition_id)
            .fetch_optional(&mut **tx)
            .await?
            .map(RunPartition::try_from)
            .transpose()
    }

    async fn fetch_run(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        for_update: bool,
    ) -> Result<BackfillRun> {
        let lock = if for_update { "FOR UPDATE" } else { "" };
        let query = format!("SELECT {RUN_COLUMNS} FROM backfill_runs WHERE id = $1 {lock}");
        sqlx::query_as::<_, RunRow>(&query)
            .bind(run_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| BackfillError::run_not_found(run_id))?
            .try_into()
    }

    async fn fetch_snapshot(
        tx: &mut Transaction<'_, Postgres>,
        partition_id: Uuid,
        for_update: bool,
    ) -> Result<Option<PartitionSnapshot>> {
        let Some(partition) = Self::fetch_partition(tx, partition_id, for_update).await? else {
            return Ok(None);
        };
        let run = Self::fetch_run(tx, partition.backfill_run_id, false).await?;
        Ok(Some(PartitionSnapshot { partition, run }))
    }

    async fn insert_event(tx: &mut Transaction<'_, Postgres>, event: &EventLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backfill_event_logs
                (id, backfill_run_id, partition_id, kind, message, extra_data, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.backfill_run_id)
        .bind(event.partition_id)
        .bind(event.kind.as_str())
        .bind(&event.message)
        .bind(&event.extra_data)
        .bind(event.occurred_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BackfillStore for PgBackfillStore {
    #[instrument(skip(self))]
    async fn claimable_partitions(&self, now: DateTime<Utc>) -> Result<Vec<ClaimCandidate>> {
        let rows = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT p.id, p.backfill_run_id, p.partition_name, r.connector,
                   p.lease_token, p.lease_expires_at
            FROM run_partitions p
            JOIN backfill_runs r ON r.id = p.backfill_run_id
            WHERE r.state = 'RUNNING'
              AND p.run_state = 'RUNNING'
              AND (p.lease_expires_at IS NULL OR p.lease_expires_at <= $1)
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        debug!(candidates = rows.len(), "Loaded claimable partitions");

        Ok(rows
            .into_iter()
            .map(|row| ClaimCandidate {
                partition_id: row.id,
                backfill_run_id: row.backfill_run_id,
                partition_name: row.partition_name,
                connector: row.connector,
                lease: lease_from_columns(row.lease_token, row.lease_expires_at),
            })
            .collect())
    }

    #[instrument(skip(self, expected, new_lease))]
    async fn try_claim_lease(
        &self,
        partition_id: Uuid,
        expected: Option<&Lease>,
        new_lease: &Lease,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_partitions
            SET lease_token = $2, lease_expires_at = $3, updated_at = now()
            WHERE id = $1
              AND lease_token IS NOT DISTINCT FROM $4
              AND lease_expires_at IS NOT DISTINCT FROM $5
            "#,
        )
        .bind(partition_id)
        .bind(&new_lease.token)
        .bind(new_lease.expires_at)
        .bind(expected.map(|lease| lease.token.as_str()))
        .bind(expected.map(|lease| lease.expires_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn load_snapshot(&self, partition_id: Uuid) -> Result<PartitionSnapshot> {
        let mut tx = self.pool.begin().await?;
        let snapshot = Self::fetch_snapshot(&mut tx, partition_id, false)
            .await?
            .ok_or_else(|| BackfillError::partition_not_found(partition_id))?;
        tx.commit().await?;
        Ok(snapshot)
    }

    #[instrument(skip(self, token, renewal))]
    async fn refresh_lease(
        &self,
        partition_id: Uuid,
        token: &str,
        renewal: &LeaseRenewal,
    ) -> Result<LeaseCheck> {
        let mut tx = self.pool.begin().await?;
        let snapshot = match Self::fetch_snapshot(&mut tx, partition_id, true).await? {
            Some(snapshot) if snapshot.partition.holds_lease(token) => snapshot,
            _ => return Ok(LeaseCheck::Lost),
        };
        if !snapshot.is_running() {
            tx.commit().await?;
            return Ok(LeaseCheck::Stopped(snapshot));
        }

        let precompute = renewal.precompute.as_ref();
        sqlx::query(
            r#"
            UPDATE run_partitions
            SET lease_expires_at = $2,
                precomputing_pkey_cursor = CASE WHEN $3 AND NOT precomputing_done
                    THEN $4 ELSE precomputing_pkey_cursor END,
                computed_scanned_record_count = CASE WHEN $3 AND NOT precomputing_done
                    THEN $5 ELSE computed_scanned_record_count END,
                computed_matching_record_count = CASE WHEN $3 AND NOT precomputing_done
                    THEN $6 ELSE computed_matching_record_count END,
                scanned_records_per_minute = COALESCE($7, scanned_records_per_minute),
                matching_records_per_minute = COALESCE($8, matching_records_per_minute),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(partition_id)
        .bind(renewal.expires_at)
        .bind(precompute.is_some())
        .bind(precompute.and_then(|p| key_bytes(p.precomputing_pkey_cursor.as_ref())))
        .bind(precompute.map(|p| p.computed_scanned_record_count))
        .bind(precompute.map(|p| p.computed_matching_record_count))
        .bind(renewal.rates.map(|r| r.scanned_per_minute))
        .bind(renewal.rates.map(|r| r.matching_per_minute))
        .execute(&mut *tx)
        .await?;

        let refreshed = Self::fetch_snapshot(&mut tx, partition_id, false)
            .await?
            .ok_or_else(|| BackfillError::partition_not_found(partition_id))?;
        tx.commit().await?;
        Ok(LeaseCheck::Held(refreshed))
    }

    #[instrument(skip(self, token, progress))]
    async fn save_progress(
        &self,
        partition_id: Uuid,
        token: &str,
        progress: &ExecutionProgress,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_partitions
            SET pkey_cursor = $3,
                backfilled_scanned_record_count = $4,
                backfilled_matching_record_count = $5,
                scanned_records_per_minute = COALESCE($6, scanned_records_per_minute),
                matching_records_per_minute = COALESCE($7, matching_records_per_minute),
                updated_at = now()
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(partition_id)
        .bind(token)
        .bind(key_bytes(progress.pkey_cursor.as_ref()))
        .bind(progress.backfilled_scanned_record_count)
        .bind(progress.backfilled_matching_record_count)
        .bind(progress.rates.map(|r| r.scanned_per_minute))
        .bind(progress.rates.map(|r| r.matching_per_minute))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, token, progress))]
    async fn save_precompute_progress(
        &self,
        partition_id: Uuid,
        token: &str,
        progress: &PrecomputeProgress,
        done: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_partitions
            SET precomputing_pkey_cursor = $3,
                computed_scanned_record_count = $4,
                computed_matching_record_count = $5,
                precomputing_done = precomputing_done OR $6,
                updated_at = now()
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(partition_id)
        .bind(token)
        .bind(key_bytes(progress.precomputing_pkey_cursor.as_ref()))
        .bind(progress.computed_scanned_record_count)
        .bind(progress.computed_matching_record_count)
        .bind(done)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, token, progress))]
    async fn complete_partition(
        &self,
        partition_id: Uuid,
        token: &str,
        progress: &ExecutionProgress,
    ) -> Result<PartitionCompletion> {
        let mut tx = self.pool.begin().await?;

        let run_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE run_partitions
            SET pkey_cursor = $3,
                backfilled_scanned_record_count = $4,
                backfilled_matching_record_count = $5,
                run_state = 'COMPLETE',
                lease_token = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND lease_token = $2
            RETURNING backfill_run_id
            "#,
        )
        .bind(partition_id)
        .bind(token)
        .bind(key_bytes(progress.pkey_cursor.as_ref()))
        .bind(progress.backfilled_scanned_record_count)
        .bind(progress.backfilled_matching_record_count)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((run_id,)) = run_id else {
            return Ok(PartitionCompletion::default());
        };

        let run_result = sqlx::query(
            r#"
            UPDATE backfill_runs
            SET state = 'COMPLETE', updated_at = now()
            WHERE id = $1
              AND state <> 'COMPLETE'
              AND NOT EXISTS (
                  SELECT 1 FROM run_partitions
                  WHERE backfill_run_id = $1 AND run_state <> 'COMPLETE'
              )
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PartitionCompletion {
            partition_completed: true,
            run_completed: run_result.rows_affected() == 1,
        })
    }

    #[instrument(skip(self, last_error))]
    async fn pause_run(&self, run_id: Uuid, partition_id: Uuid, last_error: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let paused = sqlx::query(
            "UPDATE backfill_runs SET state = 'PAUSED', updated_at = now() WHERE id = $1 AND state = 'RUNNING'",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !paused {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE run_partitions
            SET run_state = 'PAUSED',
                last_error = CASE WHEN id = $2 THEN $3 ELSE last_error END,
                updated_at = now()
            WHERE backfill_run_id = $1 AND run_state <> 'COMPLETE'
            "#,
        )
        .bind(run_id)
        .bind(partition_id)
        .bind(last_error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self, token))]
    async fn release_lease(&self, partition_id: Uuid, token: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_partitions
            SET lease_token = NULL, lease_expires_at = NULL, updated_at = now()
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(partition_id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_event(&self, event: &EventLog) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_event(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_events(&self, run_id: Uuid) -> Result<Vec<EventLog>> {
        sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, backfill_run_id, partition_id, kind, message, extra_data, occurred_at
            FROM backfill_event_logs
            WHERE backfill_run_id = $1
            ORDER BY occurred_at, id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(EventLog::try_from)
        .collect()
    }

    #[instrument(skip(self, run, partitions), fields(run_id = %run.id, partitions = partitions.len()))]
    async fn insert_run(&self, run: &BackfillRun, partitions: &[RunPartition]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO backfill_runs
                (id, name, connector, state, scan_size, batch_size, num_threads, backoff_schedule,
                 extra_sleep_ms, dry_run, parameters, created_by, created_at, updated_at, approved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(run.id)
        .bind(&run.name)
        .bind(&run.connector)
        .bind(run.state.as_str())
        .bind(run.scan_size)
        .bind(run.batch_size)
        .bind(run.num_threads)
        .bind(&run.backoff_schedule)
        .bind(run.extra_sleep_ms)
        .bind(run.dry_run)
        .bind(Json(&run.parameters))
        .bind(&run.created_by)
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.approved_at)
        .execute(&mut *tx)
        .await?;

        for partition in partitions {
            sqlx::query(
                r#"
                INSERT INTO run_partitions
                    (id, backfill_run_id, partition_name, range_start, range_end, pkey_cursor,
                     precomputing_pkey_cursor, precomputing_done, run_state, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(partition.id)
            .bind(partition.backfill_run_id)
            .bind(&partition.partition_name)
            .bind(key_bytes(partition.key_range.start.as_ref()))
            .bind(key_bytes(partition.key_range.end.as_ref()))
            .bind(key_bytes(partition.pkey_cursor.as_ref()))
            .bind(key_bytes(partition.precomputing_pkey_cursor.as_ref()))
            .bind(partition.precomputing_done)
            .bind(partition.run_state.as_str())
            .bind(partition.created_at)
            .bind(partition.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_run_state(&self, run_id: Uuid, state: BackfillState) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let run = Self::fetch_run(&mut tx, run_id, true).await?;
        if run.state.is_terminal() {
            return Err(BackfillError::InvalidState(format!(
                "backfill run {run_id} is {} and cannot become {state}",
                run.state
            )));
        }

        sqlx::query(
            r#"
            UPDATE backfill_runs
            SET state = $2,
                approved_at = CASE WHEN $2 = 'RUNNING' THEN COALESCE(approved_at, now()) ELSE approved_at END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(state.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE run_partitions
            SET run_state = $2,
                last_error = CASE WHEN $2 = 'RUNNING' THEN NULL ELSE last_error END,
                updated_at = now()
            WHERE backfill_run_id = $1 AND run_state <> 'COMPLETE'
            "#,
        )
        .bind(run_id)
        .bind(state.as_str())
        .execute(&mut *tx)
        .await?;

        let event = EventLog::state_change(
            run_id,
            None,
            format!("run state changed from {} to {state}", run.state),
        );
        Self::insert_event(&mut tx, &event).await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, settings))]
    async fn update_run_settings(&self, run_id: Uuid, settings: &RunSettings) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut run = Self::fetch_run(&mut tx, run_id, true).await?;
        settings.apply(&mut run);

        sqlx::query(
            r#"
            UPDATE backfill_runs
            SET num_threads = $2, batch_size = $3, scan_size = $4, extra_sleep_ms = $5,
                backoff_schedule = $6, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(run.num_threads)
        .bind(run.batch_size)
        .bind(run.scan_size)
        .bind(run.extra_sleep_ms)
        .bind(&run.backoff_schedule)
        .execute(&mut *tx)
        .await?;

        let mut event = EventLog::new(run_id, None, EventKind::ConfigChange, "run settings updated");
        event.extra_data = Some(serde_json::to_string(settings)?);
        Self::insert_event(&mut tx, &event).await?;

        tx.commit().await?;
        Ok(())
    }
}
