//! # Backfill Run
//!
//! One requested execution of a backfill. Created and edited by the administrative surface;
//! the engine only reads it, except for the terminal PAUSED-on-exhaustion and COMPLETE
//! transitions it makes itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::DEFAULT_BACKOFF_SCHEDULE_MS;
use crate::error::BackfillError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackfillState {
    Paused,
    Running,
    Complete,
    Cancelled,
}

impl BackfillState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillState::Paused => "PAUSED",
            BackfillState::Running => "RUNNING",
            BackfillState::Complete => "COMPLETE",
            BackfillState::Cancelled => "CANCELLED",
        }
    }

    /// No transition leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackfillState::Complete | BackfillState::Cancelled)
    }
}

impl fmt::Display for BackfillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillState {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PAUSED" => Ok(BackfillState::Paused),
            "RUNNING" => Ok(BackfillState::Running),
            "COMPLETE" => Ok(BackfillState::Complete),
            "CANCELLED" => Ok(BackfillState::Cancelled),
            other => Err(BackfillError::InvalidState(format!(
                "unknown backfill state '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillRun {
    pub id: Uuid,
    /// Registered backfill name, used in logs and metrics.
    pub name: String,
    /// Selects the Batch Source / Batch Client pair in the connector registry.
    pub connector: String,
    pub state: BackfillState,
    pub scan_size: i64,
    pub batch_size: i64,
    pub num_threads: i32,
    /// Delays in milliseconds, indexed by consecutive failure count. `None` uses the default.
    pub backoff_schedule: Option<Vec<i64>>,
    pub extra_sleep_ms: i64,
    pub dry_run: bool,
    /// Caller parameters forwarded verbatim to the Batch Source and Batch Client.
    pub parameters: HashMap<String, String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl BackfillRun {
    /// New run in PAUSED state with conservative defaults.
    pub fn new(
        name: impl Into<String>,
        connector: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            connector: connector.into(),
            state: BackfillState::Paused,
            scan_size: 10_000,
            batch_size: 100,
            num_threads: 1,
            backoff_schedule: None,
            extra_sleep_ms: 0,
            dry_run: true,
            parameters: HashMap::new(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            approved_at: None,
        }
    }

    /// The run's schedule, or the system default when unset or empty.
    pub fn effective_backoff_schedule(&self) -> Vec<u64> {
        match &self.backoff_schedule {
            Some(schedule) if !schedule.is_empty() => schedule
                .iter()
                .map(|delay| u64::try_from(*delay).unwrap_or(0))
                .collect(),
            _ => DEFAULT_BACKOFF_SCHEDULE_MS.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in [
            BackfillState::Paused,
            BackfillState::Running,
            BackfillState::Complete,
            BackfillState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<BackfillState>().unwrap(), state);
        }
        assert!("DONE".parse::<BackfillState>().is_err());
    }

    #[test]
    fn test_effective_backoff_schedule_defaults() {
        let mut run = BackfillRun::new("reindex", "static", "alice");
        assert_eq!(run.effective_backoff_schedule(), vec![5_000, 15_000, 30_000]);

        run.backoff_schedule = Some(vec![]);
        assert_eq!(run.effective_backoff_schedule(), vec![5_000, 15_000, 30_000]);

        run.backoff_schedule = Some(vec![1_000, 2_000]);
        assert_eq!(run.effective_backoff_schedule(), vec![1_000, 2_000]);
    }

    #[test]
    fn test_terminal_states() {
        assert!(BackfillState::Complete.is_terminal());
        assert!(BackfillState::Cancelled.is_terminal());
        assert!(!BackfillState::Paused.is_terminal());
        assert!(!BackfillState::Running.is_terminal());
    }
}
