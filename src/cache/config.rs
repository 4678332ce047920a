//! Engine defaults.
//!
//! Per-query and per-mutation options start from these values; the binary
//! loads them from the `[client]` table of `querycache.toml`.

use std::time::Duration;

use serde::Deserialize;

use crate::gate::NetworkMode;
use crate::query::RetryPolicy;

// Default values for client configuration
const DEFAULT_STALE_TIME_MS: u64 = 0;
const DEFAULT_CACHE_TIME_MS: u64 = 5 * 60 * 1000;
const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 0;
const DEFAULT_MUTATION_GC_TIME_MS: u64 = 5 * 60 * 1000;

/// Client-wide defaults applied to new queries and mutations.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a fetched result counts as fresh.
    pub stale_time_ms: u64,
    /// How long an entry outlives its last consumer; `0` never persists results.
    pub cache_time_ms: u64,
    /// Retries after the first failed attempt of a query.
    pub retry_count: u32,
    /// Delay between query retries.
    pub retry_delay_ms: u64,
    /// Whether executions pause while offline.
    pub network_mode: NetworkMode,
    /// Refetch stale queries when the host regains focus.
    pub refetch_on_focus: bool,
    /// Refetch stale queries when the host comes back online.
    pub refetch_on_reconnect: bool,
    /// How long a mutation's state stream outlives its last handle.
    pub mutation_gc_time_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: DEFAULT_STALE_TIME_MS,
            cache_time_ms: DEFAULT_CACHE_TIME_MS,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            network_mode: NetworkMode::Online,
            refetch_on_focus: true,
            refetch_on_reconnect: true,
            mutation_gc_time_ms: DEFAULT_MUTATION_GC_TIME_MS,
        }
    }
}

impl ClientConfig {
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn cache_time(&self) -> Duration {
        Duration::from_millis(self.cache_time_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn mutation_gc_time(&self) -> Duration {
        Duration::from_millis(self.mutation_gc_time_ms)
    }

    /// Retry policy for queries built from `retry_count`.
    pub fn query_retry(&self) -> RetryPolicy {
        match self.retry_count {
            0 => RetryPolicy::Never,
            count => RetryPolicy::Count(count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = ClientConfig::default();
        assert_eq!(config.stale_time(), Duration::ZERO);
        assert_eq!(config.cache_time(), Duration::from_secs(300));
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_delay(), Duration::ZERO);
        assert_eq!(config.network_mode, NetworkMode::Online);
        assert!(config.refetch_on_focus);
        assert!(config.refetch_on_reconnect);
        assert_eq!(config.mutation_gc_time(), Duration::from_secs(300));
    }

    #[test]
    fn zero_retry_count_disables_retries() {
        let config = ClientConfig {
            retry_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.query_retry(), RetryPolicy::Never));
    }

    #[test]
    fn deserializes_partial_tables() {
        let config: ClientConfig =
            serde_json::from_str(r#"{ "stale_time_ms": 1500, "network_mode": "always" }"#)
                .expect("valid client config");
        assert_eq!(config.stale_time(), Duration::from_millis(1500));
        assert_eq!(config.network_mode, NetworkMode::Always);
        assert_eq!(config.retry_count, DEFAULT_RETRY_COUNT);
    }
}
