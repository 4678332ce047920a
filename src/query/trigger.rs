//! Fetch triggers delivered to a query pipeline.

use std::fmt;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::QueryKey;

/// Why a pipeline was asked to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerReason {
    /// A consumer attached to the query.
    Mount,
    /// The entry was invalidated.
    Invalidated,
    /// The refetch interval elapsed.
    Interval,
    /// A consumer asked for a refetch.
    Manual,
    /// The query went from disabled to enabled.
    Enabled,
    /// The host regained focus.
    Focus,
    /// The network came back.
    Reconnect,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Invalidated => "invalidated",
            Self::Interval => "interval",
            Self::Manual => "manual",
            Self::Enabled => "enabled",
            Self::Focus => "focus",
            Self::Reconnect => "reconnect",
        }
    }

    /// Whether triggers of this kind bypass the freshness check.
    pub fn ignores_stale(&self) -> bool {
        matches!(self, Self::Invalidated | Self::Interval | Self::Manual)
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request for a pipeline to (re)fetch its key.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub id: Uuid,
    pub key: QueryKey,
    pub reason: TriggerReason,
    /// Fetch even when the cached result is still fresh.
    pub ignore_stale: bool,
    pub raised_at: OffsetDateTime,
}

impl Trigger {
    /// Build a trigger whose freshness handling follows its reason.
    pub fn new(key: QueryKey, reason: TriggerReason) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            reason,
            ignore_stale: reason.ignores_stale(),
            raised_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn mount(key: QueryKey) -> Self {
        Self::new(key, TriggerReason::Mount)
    }

    pub fn invalidated(key: QueryKey) -> Self {
        Self::new(key, TriggerReason::Invalidated)
    }

    pub fn manual(key: QueryKey) -> Self {
        Self::new(key, TriggerReason::Manual)
    }
}
