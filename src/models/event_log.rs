use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BackfillError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    StateChange,
    Error,
    ConfigChange,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateChange => "STATE_CHANGE",
            EventKind::Error => "ERROR",
            EventKind::ConfigChange => "CONFIG_CHANGE",
        }
    }
}

impl FromStr for EventKind {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STATE_CHANGE" => Ok(EventKind::StateChange),
            "ERROR" => Ok(EventKind::Error),
            "CONFIG_CHANGE" => Ok(EventKind::ConfigChange),
            other => Err(BackfillError::InvalidState(format!(
                "unknown event kind '{other}'"
            ))),
        }
    }
}

/// Operator-visible history entry for a run or one of its partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    pub id: Uuid,
    pub backfill_run_id: Uuid,
    pub partition_id: Option<Uuid>,
    pub kind: EventKind,
    pub message: String,
    pub extra_data: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl EventLog {
    pub fn new(
        backfill_run_id: Uuid,
        partition_id: Option<Uuid>,
        kind: EventKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backfill_run_id,
            partition_id,
            kind,
            message: message.into(),
            extra_data: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn state_change(
        backfill_run_id: Uuid,
        partition_id: Option<Uuid>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(backfill_run_id, partition_id, EventKind::StateChange, message)
    }

    pub fn error(
        backfill_run_id: Uuid,
        partition_id: Uuid,
        message: impl Into<String>,
        extra_data: Option<String>,
    ) -> Self {
        Self {
            extra_data,
            ..Self::new(backfill_run_id, Some(partition_id), EventKind::Error, message)
        }
    }
}
