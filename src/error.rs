//! Error types for the backfill engine.

use thiserror::Error;
use uuid::Uuid;

use crate::channel::ChannelError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackfillError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Lease lost on partition {partition_id}")]
    LeaseLost { partition_id: Uuid },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Connector error: {0}")]
    Connector(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl BackfillError {
    pub fn run_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "Backfill run",
            id,
        }
    }

    pub fn partition_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "Run partition",
            id,
        }
    }
}

impl From<sqlx::Error> for BackfillError {
    fn from(err: sqlx::Error) -> Self {
        BackfillError::Database(err.to_string())
    }
}

impl From<config::ConfigError> for BackfillError {
    fn from(err: config::ConfigError) -> Self {
        BackfillError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for BackfillError {
    fn from(err: serde_json::Error) -> Self {
        BackfillError::Database(format!("JSON serialization error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, BackfillError>;

/// Which side of a batch call produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The call itself failed: connection reset, timeout, non-2xx.
    Transport,
    /// The call returned, but the caller's transform reported an exception.
    Application,
}

/// Unified outcome for a failed Batch Source or Batch Client call.
///
/// Transport and application failures are retried identically; `detail` carries the
/// client-reported stack trace (if any) so operators can see why a partition paused.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind:?} failure: {message}")]
pub struct BatchFailure {
    pub kind: FailureKind,
    pub message: String,
    pub detail: Option<String>,
}

impl BatchFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: message.into(),
            detail: None,
        }
    }

    pub fn application(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Application,
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    /// Text persisted as the partition's `last_error`.
    pub fn diagnostic(&self) -> String {
        match &self.detail {
            Some(detail) => format!("{}\n{}", self.message, detail),
            None => self.message.clone(),
        }
    }
}
