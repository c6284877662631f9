//! # Registry Infrastructure
//!
//! Process-wide registries. Currently the connector registry, which resolves the Batch Source
//! and Batch Client for a run.

pub mod connector_registry;

pub use connector_registry::{Connector, ConnectorRegistry};
