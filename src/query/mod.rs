//! Query side of the engine: deduplicated executions, retries, per-key
//! pipelines and invalidation.

mod client;
pub mod dedupe;
mod invalidation;
mod options;
mod pipeline;
pub mod retry;
mod scheduler;
mod state;
mod trigger;

pub use client::{QueryClient, QueryHandle};
pub use dedupe::{Deduplicator, ExecutionEvent, Subscription};
pub use invalidation::{InvalidateFilters, InvalidationReport, KeyPredicate};
pub use options::{QueryFn, QueryOptions};
pub use pipeline::{Listener, ListenerGuard};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::RefetchScheduler;
pub use state::{FetchStatus, QueryState, QueryStatus};
pub use trigger::{Trigger, TriggerReason};
