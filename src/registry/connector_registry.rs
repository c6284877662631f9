//! # Connector Registry
//!
//! Maps a run's `connector` name to the Batch Source / Batch Client pair that serves it.
//! Registration happens once at process start; lookups happen on every successful lease.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::{BatchClient, BatchSource};
use crate::error::{BackfillError, Result};

/// A resolved Batch Source / Batch Client pair.
#[derive(Clone)]
pub struct Connector {
    pub source: Arc<dyn BatchSource>,
    pub client: Arc<dyn BatchClient>,
}

impl Connector {
    pub fn new(source: Arc<dyn BatchSource>, client: Arc<dyn BatchClient>) -> Self {
        Self { source, client }
    }

    /// Connector whose source and client are the same object.
    pub fn from_shared<C>(connector: Arc<C>) -> Self
    where
        C: BatchSource + BatchClient + 'static,
    {
        Self {
            source: connector.clone(),
            client: connector,
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector").finish_non_exhaustive()
    }
}

/// Thread-safe connector lookup shared by every lease hunter in the process.
#[derive(Debug, Clone, Default)]
pub struct ConnectorRegistry {
    connectors: Arc<DashMap<String, Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the connector for `name`.
    pub fn register(&self, name: impl Into<String>, connector: Connector) {
        let name = name.into();
        if self.connectors.insert(name.clone(), connector).is_some() {
            info!(connector = %name, "Replaced registered connector");
        } else {
            info!(connector = %name, "Registered connector");
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Connector> {
        match self.connectors.get(name) {
            Some(entry) => Ok(entry.value().clone()),
            None => {
                debug!(connector = %name, "Connector lookup missed");
                Err(BackfillError::Connector(format!(
                    "no connector registered for '{name}'"
                )))
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connectors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{StaticBatchHandler, StaticDatasource};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Noop;

    #[async_trait]
    impl StaticBatchHandler<u8> for Noop {
        async fn run_batch(
            &self,
            _items: &[u8],
            _parameters: &HashMap<String, String>,
            _dry_run: bool,
        ) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = ConnectorRegistry::new();
        let datasource = Arc::new(StaticDatasource::new(vec![1u8, 2, 3], Arc::new(Noop)));
        registry.register("static", Connector::from_shared(datasource));

        assert!(registry.contains("static"));
        assert!(registry.resolve("static").is_ok());
        assert_eq!(registry.names(), vec!["static".to_string()]);
    }

    #[test]
    fn test_resolve_unknown_connector_fails() {
        let registry = ConnectorRegistry::new();
        let err = registry.resolve("grpc").unwrap_err();
        assert!(matches!(err, BackfillError::Connector(_)));
    }
}
