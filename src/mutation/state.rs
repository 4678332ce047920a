use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::QueryError;

/// How overlapping `mutate` calls are coordinated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapOperator {
    /// Run every call concurrently; the latest result to arrive wins.
    #[default]
    Merge,
    /// Queue calls and run them one at a time in submission order.
    Concat,
    /// Cancel the running call whenever a new one arrives.
    Switch,
}

impl MapOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Concat => "concat",
            Self::Switch => "switch",
        }
    }
}

impl fmt::Display for MapOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MapOperator {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "concat" => Ok(Self::Concat),
            "switch" => Ok(Self::Switch),
            other => Err(format!(
                "unknown map operator `{other}` (expected merge, concat or switch)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
    /// Waiting for the network before the next attempt.
    Paused,
}

/// Snapshot published by a mutation runner.
#[derive(Debug)]
pub struct MutationState<V, D> {
    pub status: MutationStatus,
    pub variables: Option<V>,
    pub data: Option<Arc<D>>,
    pub error: Option<QueryError>,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    pub submitted_at: Option<OffsetDateTime>,
}

impl<V: Clone, D> Clone for MutationState<V, D> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            variables: self.variables.clone(),
            data: self.data.clone(),
            error: self.error.clone(),
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            submitted_at: self.submitted_at,
        }
    }
}

impl<V, D> Default for MutationState<V, D> {
    fn default() -> Self {
        Self {
            status: MutationStatus::Idle,
            variables: None,
            data: None,
            error: None,
            failure_count: 0,
            failure_reason: None,
            submitted_at: None,
        }
    }
}

impl<V, D> MutationState<V, D> {
    pub(crate) fn pending(variables: V) -> Self {
        Self {
            status: MutationStatus::Pending,
            variables: Some(variables),
            submitted_at: Some(OffsetDateTime::now_utc()),
            ..Self::default()
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }

    pub fn is_paused(&self) -> bool {
        self.status == MutationStatus::Paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_parses_case_insensitively() {
        assert_eq!("Concat".parse::<MapOperator>(), Ok(MapOperator::Concat));
        assert_eq!(" switch ".parse::<MapOperator>(), Ok(MapOperator::Switch));
        assert!("exhaust".parse::<MapOperator>().is_err());
    }

    #[test]
    fn pending_state_records_variables() {
        let state: MutationState<&str, ()> = MutationState::pending("a");
        assert!(state.is_pending());
        assert_eq!(state.variables, Some("a"));
        assert!(state.submitted_at.is_some());
        assert!(state.data.is_none());
    }
}
