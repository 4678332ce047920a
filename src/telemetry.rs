use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry initialization failed: {0}")]
    Init(String),
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Init(format!("failed to install tracing subscriber: {err}")))
}

/// Register descriptions for every metric the engine records.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "querycache_fetch_total",
            Unit::Count,
            "Total number of query executions started by pipelines."
        );
        describe_counter!(
            "querycache_cache_hit_total",
            Unit::Count,
            "Total number of triggers served from a fresh cached result."
        );
        describe_counter!(
            "querycache_dedupe_join_total",
            Unit::Count,
            "Total number of requests that joined an in-flight execution."
        );
        describe_counter!(
            "querycache_retry_total",
            Unit::Count,
            "Total number of retried attempts."
        );
        describe_counter!(
            "querycache_invalidated_total",
            Unit::Count,
            "Total number of entries flagged stale by invalidation."
        );
        describe_counter!(
            "querycache_mutation_total",
            Unit::Count,
            "Total number of submitted mutations, labelled by map operator."
        );
        describe_histogram!(
            "querycache_fetch_ms",
            Unit::Milliseconds,
            "Query execution latency in milliseconds."
        );
    });
}
