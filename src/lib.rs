#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Backfill Core Rust
//!
//! Scheduling and execution engine for long-running, resumable backfills over a keyspace.
//!
//! ## Overview
//!
//! A backfill run is split into partitions. Worker processes hunt for partitions to lease,
//! and each leased partition is driven by a runner that walks the keyspace in batches: a
//! Batch Source computes batch ranges, a Batch Client processes them, and the committed
//! cursor is persisted after every batch so any worker can resume where another stopped.
//!
//! ## Key Features
//!
//! - **Distributed Leasing**: Compare-and-set leases, no coordinator required
//! - **Pipelined Execution**: Prefetch, precompute and execute stages per partition
//! - **Ordered Commits**: Concurrent batch calls, strictly ordered cursor advancement
//! - **Backoff and Pause**: Per-run backoff schedule; exhausting it pauses the run durably
//! - **Live Tuning**: `num_threads` and batch sizing picked up without restarting runners
//!
//! ## Module Organization
//!
//! - [`scheduler`] - Lease hunting and the worker's runner loop
//! - [`runner`] - Per-partition pipeline
//! - [`channel`] - Resizable bounded channel between prefetch and execute
//! - [`rate_counter`] - Sliding-window throughput estimate
//! - [`client`] - Batch Source / Batch Client contracts and the static datasource
//! - [`registry`] - Connector registry
//! - [`store`] - Persisted state (in-memory and PostgreSQL)
//! - [`models`] - Runs, partitions, batches, event log
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backfill_core::config::ConfigManager;
//! use backfill_core::registry::ConnectorRegistry;
//! use backfill_core::scheduler::RunnerScheduler;
//! use backfill_core::store::InMemoryBackfillStore;
//! use backfill_core::stop::StopSignal;
//! use std::sync::Arc;
//!
//! # async fn example() -> backfill_core::Result<()> {
//! let manager = ConfigManager::load()?;
//! let registry = Arc::new(ConnectorRegistry::new());
//! let scheduler = RunnerScheduler::from_config(
//!     Arc::new(InMemoryBackfillStore::new()),
//!     registry,
//!     manager.config(),
//! );
//! scheduler.run_until_stopped(StopSignal::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod rate_counter;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod stop;
pub mod store;

pub use channel::{ChannelError, ChannelReceiver, ChannelSender, VariableCapacityChannel};
pub use client::{BatchClient, BatchSource, StaticBatchHandler, StaticDatasource};
pub use clock::{Clock, FakeClock, SharedClock, SystemClock};
pub use config::{BackfillConfig, ConfigManager};
pub use error::{BackfillError, BatchFailure, FailureKind, Result};
pub use models::{
    BackfillRun, BackfillState, Batch, EventKind, EventLog, KeyRange, PrimaryKey, RunPartition,
};
pub use rate_counter::RateCounter;
pub use registry::{Connector, ConnectorRegistry};
pub use runner::{BackfillRunner, RunnerHandle, RunnerSettings, RunnerState};
pub use scheduler::{LeaseHunter, RunnerScheduler};
pub use stop::StopSignal;
pub use store::{BackfillStore, InMemoryBackfillStore, PgBackfillStore};
