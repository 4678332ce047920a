//! Per-query options.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};

use super::retry::RetryPolicy;
use crate::cache::{ClientConfig, QueryKey};
use crate::error::BoxError;
use crate::gate::NetworkMode;

/// User function producing the values of one query.
///
/// A future-based function yields one value per execution; a stream-based
/// one may yield many before completing.
pub type QueryFn<T> = Arc<dyn Fn(&QueryKey) -> BoxStream<'static, Result<T, BoxError>> + Send + Sync>;

/// Options controlling one query. Builder methods start from [`ClientConfig`]
/// defaults.
pub struct QueryOptions<T> {
    pub query_fn: QueryFn<T>,
    /// Disabled queries ignore triggers.
    pub enabled: bool,
    pub stale_time: Duration,
    /// Grace period an entry outlives its last consumer. Zero never persists
    /// results to the store.
    pub cache_time: Duration,
    pub retry: RetryPolicy,
    pub retry_delay: Duration,
    /// Refetch this long after each successful result.
    pub refetch_interval: Option<Duration>,
    pub network_mode: NetworkMode,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            query_fn: Arc::clone(&self.query_fn),
            enabled: self.enabled,
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            retry: self.retry.clone(),
            retry_delay: self.retry_delay,
            refetch_interval: self.refetch_interval,
            network_mode: self.network_mode,
            refetch_on_focus: self.refetch_on_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
        }
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("refetch_interval", &self.refetch_interval)
            .field("network_mode", &self.network_mode)
            .field("refetch_on_focus", &self.refetch_on_focus)
            .field("refetch_on_reconnect", &self.refetch_on_reconnect)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> QueryOptions<T> {
    pub fn new(query_fn: QueryFn<T>) -> Self {
        let defaults = ClientConfig::default();
        Self {
            query_fn,
            enabled: true,
            stale_time: defaults.stale_time(),
            cache_time: defaults.cache_time(),
            retry: defaults.query_retry(),
            retry_delay: defaults.retry_delay(),
            refetch_interval: None,
            network_mode: defaults.network_mode,
            refetch_on_focus: defaults.refetch_on_focus,
            refetch_on_reconnect: defaults.refetch_on_reconnect,
        }
    }

    /// Query backed by a function returning one future per execution.
    pub fn from_future<F, Fut, E>(f: F) -> Self
    where
        F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self::new(Arc::new(move |key: &QueryKey| {
            let fut = f(key.clone());
            stream::once(async move { fut.await.map_err(Into::<BoxError>::into) }).boxed()
        }))
    }

    /// Query backed by a function returning a stream of values.
    pub fn from_stream<F, S, E>(f: F) -> Self
    where
        F: Fn(QueryKey) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self::new(Arc::new(move |key: &QueryKey| {
            f(key.clone()).map(|item| item.map_err(Into::<BoxError>::into)).boxed()
        }))
    }

    /// Replace the defaults with the client's configuration.
    pub fn with_config(mut self, config: &ClientConfig) -> Self {
        self.stale_time = config.stale_time();
        self.cache_time = config.cache_time();
        self.retry = config.query_retry();
        self.retry_delay = config.retry_delay();
        self.network_mode = config.network_mode;
        self.refetch_on_focus = config.refetch_on_focus;
        self.refetch_on_reconnect = config.refetch_on_reconnect;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn with_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = network_mode;
        self
    }

    pub fn with_refetch_on_focus(mut self, refetch: bool) -> Self {
        self.refetch_on_focus = refetch;
        self
    }

    pub fn with_refetch_on_reconnect(mut self, refetch: bool) -> Self {
        self.refetch_on_reconnect = refetch;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;

    #[tokio::test]
    async fn future_functions_yield_one_value() {
        let options = QueryOptions::from_future(|key: QueryKey| async move {
            Ok::<_, BoxError>(key.len())
        });
        let values: Vec<_> = (options.query_fn)(&query_key!["a", "b"]).collect().await;
        assert_eq!(values.len(), 1);
        assert_eq!(*values[0].as_ref().expect("value"), 2);
    }

    #[tokio::test]
    async fn stream_functions_yield_every_value() {
        let options = QueryOptions::from_stream(|_key: QueryKey| {
            stream::iter([Ok::<_, BoxError>(1), Ok(2), Ok(3)])
        });
        let values: Vec<_> = (options.query_fn)(&query_key!["a"])
            .map(|item| item.expect("value"))
            .collect()
            .await;
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn config_overrides_defaults() {
        let config = ClientConfig {
            stale_time_ms: 1000,
            retry_count: 0,
            network_mode: NetworkMode::Always,
            ..ClientConfig::default()
        };
        let options = QueryOptions::from_future(|_key: QueryKey| async { Ok::<_, BoxError>(()) })
            .with_config(&config)
            .with_refetch_interval(Duration::from_secs(5));

        assert_eq!(options.stale_time, Duration::from_secs(1));
        assert!(matches!(options.retry, RetryPolicy::Never));
        assert_eq!(options.network_mode, NetworkMode::Always);
        assert_eq!(options.refetch_interval, Some(Duration::from_secs(5)));
        assert!(options.enabled);
    }
}
