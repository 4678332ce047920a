use std::sync::Arc;

use time::OffsetDateTime;

use crate::error::QueryError;

/// Whether the query has data, an error, or neither yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    #[default]
    Pending,
    Success,
    Error,
}

/// Whether an execution is currently running for the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
    #[default]
    Idle,
    Fetching,
}

/// Snapshot published to a query's consumers.
#[derive(Debug)]
pub struct QueryState<T> {
    pub data: Option<Arc<T>>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    /// Terminal error of the last execution.
    pub error: Option<QueryError>,
    /// Failed attempts of the running or last execution.
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    /// The running execution waits for the network.
    pub is_paused: bool,
    pub data_updated_at: Option<OffsetDateTime>,
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            status: self.status,
            fetch_status: self.fetch_status,
            error: self.error.clone(),
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            is_paused: self.is_paused,
            data_updated_at: self.data_updated_at,
        }
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            error: None,
            failure_count: 0,
            failure_reason: None,
            is_paused: false,
            data_updated_at: None,
        }
    }
}

impl<T> QueryState<T> {
    /// Initial state for a consumer attaching to an entry that may already
    /// hold a result.
    pub fn from_cached(data: Option<Arc<T>>) -> Self {
        let status = if data.is_some() {
            QueryStatus::Success
        } else {
            QueryStatus::Pending
        };
        Self {
            data,
            status,
            ..Self::default()
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// Settled: not fetching, with either data or an error.
    pub fn is_settled(&self) -> bool {
        !self.is_fetching() && !self.is_pending()
    }
}
