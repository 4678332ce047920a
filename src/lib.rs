//! In-process data-fetching cache.
//!
//! Queries are identified by structured [`QueryKey`]s. Concurrent requests
//! for the same key share one execution, results are cached with a
//! stale/invalidate protocol, failed attempts are retried, and executions
//! pause while the host is offline. Mutations coordinate overlapping calls
//! with merge, concat or switch semantics.

pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod mutation;
pub mod query;
pub mod telemetry;

pub use cache::{ClientConfig, QueryKey};
pub use error::{BoxError, QueryError};
pub use gate::{NetworkGate, NetworkMode};
pub use mutation::{MapOperator, MutationOptions, MutationRunner, MutationState, MutationStatus};
pub use query::{
    InvalidateFilters, InvalidationReport, QueryClient, QueryHandle, QueryOptions, QueryState,
    QueryStatus, RetryPolicy,
};

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
