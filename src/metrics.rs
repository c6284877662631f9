//! # Backfill Metrics
//!
//! OpenTelemetry instruments for lease hunting and partition execution. Instruments are
//! built from the global meter provider, so they are no-ops until the host process installs
//! an exporter.
//!
//! ## Usage
//!
//! ```rust
//! use backfill_core::metrics::*;
//! use uuid::Uuid;
//!
//! let labels = partition_labels(Uuid::nil(), "-80");
//! batches_completed().add(1, &labels);
//! prefetch_queue_depth().record(12, &labels);
//! ```

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use uuid::Uuid;

static BACKFILL_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    BACKFILL_METER.get_or_init(|| opentelemetry::global::meter_provider().meter("backfill-core"))
}

/// Standard labels for per-partition instruments.
pub fn partition_labels(backfill_run_id: Uuid, partition_name: &str) -> [KeyValue; 2] {
    [
        KeyValue::new("backfill_run_id", backfill_run_id.to_string()),
        KeyValue::new("partition", partition_name.to_string()),
    ]
}

// ============================================================================
// Counters - Leasing
// ============================================================================

/// Leases won by this worker's hunts
///
/// Labels:
/// - backfill_run_id
/// - partition
pub fn leases_acquired() -> Counter<u64> {
    meter()
        .u64_counter("backfill.lease.acquired")
        .with_description("Partition leases acquired by lease hunting")
        .build()
}

/// Runners that stopped because another worker holds their lease
pub fn leases_lost() -> Counter<u64> {
    meter()
        .u64_counter("backfill.lease.lost")
        .with_description("Runners stopped after their lease was superseded")
        .build()
}

// ============================================================================
// Counters - Execution
// ============================================================================

pub fn batches_completed() -> Counter<u64> {
    meter()
        .u64_counter("backfill.batches.completed")
        .with_description("Batches committed to the partition cursor")
        .build()
}

/// Failed batch attempts, including retries
///
/// Labels:
/// - backfill_run_id
/// - partition
/// - kind: transport | application
pub fn batches_failed() -> Counter<u64> {
    meter()
        .u64_counter("backfill.batches.failed")
        .with_description("Batch source or client calls that failed")
        .build()
}

pub fn records_scanned() -> Counter<u64> {
    meter()
        .u64_counter("backfill.records.scanned")
        .with_description("Records scanned by committed batches")
        .build()
}

pub fn records_matched() -> Counter<u64> {
    meter()
        .u64_counter("backfill.records.matched")
        .with_description("Matching records in committed batches")
        .build()
}

/// Partitions paused after exhausting their backoff schedule
pub fn partitions_paused() -> Counter<u64> {
    meter()
        .u64_counter("backfill.partitions.paused")
        .with_description("Runs paused after exhausting the backoff schedule")
        .build()
}

// ============================================================================
// Gauges and histograms
// ============================================================================

/// Batches prefetched and waiting for dispatch
pub fn prefetch_queue_depth() -> Gauge<u64> {
    meter()
        .u64_gauge("backfill.prefetch.queue_depth")
        .with_description("Batches waiting in the prefetch buffer")
        .build()
}

/// Runners currently alive in this worker
pub fn active_runners() -> Gauge<u64> {
    meter()
        .u64_gauge("backfill.runners.active")
        .with_description("Partition runners alive in this worker")
        .build()
}

/// Estimated seconds until the partition finishes, once precompute totals are known
pub fn partition_eta_seconds() -> Gauge<u64> {
    meter()
        .u64_gauge("backfill.partition.eta_seconds")
        .with_description("Projected seconds until the partition completes")
        .build()
}

/// Wall time of a single client call in milliseconds
pub fn batch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("backfill.batch.duration_ms")
        .with_description("Duration of run-batch calls in milliseconds")
        .build()
}

/// Wall time of a single source call in milliseconds
///
/// Labels:
/// - backfill_run_id
/// - partition
/// - precomputing: true | false
pub fn source_call_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("backfill.source.duration_ms")
        .with_description("Duration of get-next-batch-range calls in milliseconds")
        .build()
}
