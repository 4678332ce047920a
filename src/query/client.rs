//! Client façade over the store, dedupe layer and pipelines.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use metrics::counter;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::dedupe::{Deduplicator, ExecutionEvent};
use super::invalidation::{self, InvalidateFilters, InvalidationReport};
use super::options::QueryOptions;
use super::pipeline::{
    self, Listener, ListenerGuard, METRIC_CACHE_HIT_TOTAL, PipelineContext, PipelineRegistry,
    PipelineShared, live,
};
use super::state::QueryState;
use super::trigger::Trigger;
use crate::cache::{CacheStore, ClientConfig, EntryPatch, QueryKey};
use crate::error::QueryError;
use crate::gate::NetworkGate;

struct ClientInner<T> {
    config: ClientConfig,
    context: PipelineContext<T>,
    pipelines: Arc<PipelineRegistry<T>>,
}

/// Entry point for queries and invalidation over one value type.
///
/// Cloning yields another handle to the same cache.
pub struct QueryClient<T> {
    inner: Arc<ClientInner<T>>,
}

impl<T> Clone for QueryClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> QueryClient<T> {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_gate(config, NetworkGate::default())
    }

    /// Build a client whose executions follow `gate`.
    pub fn with_gate(config: ClientConfig, gate: NetworkGate) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                context: PipelineContext {
                    store: CacheStore::new(),
                    dedupe: Deduplicator::new(),
                    gate,
                },
                pipelines: Arc::new(PipelineRegistry::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn gate(&self) -> &NetworkGate {
        &self.inner.context.gate
    }

    pub fn store(&self) -> &CacheStore<T> {
        &self.inner.context.store
    }

    /// Attach a consumer to `key`.
    ///
    /// The first consumer starts the key's pipeline; later consumers share
    /// it, replace its options with `options`, and raise a mount trigger.
    /// Must be called within a Tokio runtime.
    pub fn query(&self, key: impl Into<QueryKey>, options: QueryOptions<T>) -> QueryHandle<T> {
        let key = key.into();
        let hash = key.hash_key();

        // Arcs upgraded under the registry lock are only dropped after it is
        // released, since dropping the last one re-enters the registry.
        let (shared, created) = match self.inner.pipelines.entry(hash) {
            Entry::Occupied(mut occupied) => match occupied.get().upgrade() {
                Some(shared) => (shared, false),
                None => {
                    let shared = self.spawn(key, options.clone());
                    occupied.insert(Arc::downgrade(&shared));
                    (shared, true)
                }
            },
            Entry::Vacant(vacant) => {
                let shared = self.spawn(key, options.clone());
                vacant.insert(Arc::downgrade(&shared));
                (shared, true)
            }
        };

        if !created {
            debug!(query_key = %shared.key, "Consumer joined running pipeline");
            shared.replace_options(options);
            shared.trigger(Trigger::mount(shared.key.clone()));
        }
        QueryHandle { shared }
    }

    fn spawn(&self, key: QueryKey, options: QueryOptions<T>) -> Arc<PipelineShared<T>> {
        pipeline::spawn(
            self.inner.context.clone(),
            key,
            options,
            Arc::clone(&self.inner.pipelines),
        )
    }

    /// Fetch `key` once and return its first value.
    ///
    /// Serves a fresh cached result when one exists; otherwise joins the
    /// running execution for the key or starts one. The result is written to
    /// the store and kept for `options.cache_time`.
    pub async fn fetch_query(
        &self,
        key: impl Into<QueryKey>,
        options: QueryOptions<T>,
    ) -> Result<Arc<T>, QueryError> {
        let key = key.into();
        let hash = key.hash_key();
        let store = &self.inner.context.store;
        let runner = store.add_runner(&key);

        let cached = store
            .get(&hash)
            .filter(|entry| entry.is_fresh(options.stale_time, Instant::now()))
            .and_then(|entry| entry.cached_result.clone());
        if let Some(result) = cached {
            counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
            runner.release_after(options.cache_time);
            return Ok(result);
        }

        let mut subscription = self.inner.context.dedupe.dedupe(
            &hash,
            pipeline::execution(&key, &options, &self.inner.context.gate),
        );
        let outcome = loop {
            match subscription.next().await {
                Some(ExecutionEvent::Value(value)) => break Ok(value),
                Some(ExecutionEvent::Failed(error)) => break Err(error),
                Some(ExecutionEvent::Complete) | None => {
                    break Err(QueryError::failed("query completed without a value"));
                }
                Some(_) => {}
            }
        };
        drop(subscription);

        if let Ok(value) = &outcome {
            if !options.cache_time.is_zero() {
                store.update(
                    &hash,
                    EntryPatch::new()
                        .result(Some(Arc::clone(value)))
                        .fetched_at(Some(Instant::now()))
                        .stale(false),
                );
            }
        }
        runner.release_after(options.cache_time);
        outcome
    }

    /// Mark matching entries stale and refetch the live ones.
    pub fn invalidate_queries(&self, filters: InvalidateFilters) -> InvalidationReport {
        invalidation::invalidate(&self.inner.context.store, &self.inner.pipelines, &filters)
    }

    /// Register `listener` on the live query for `key`.
    ///
    /// Returns `None` when no consumer holds the key.
    pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Option<ListenerGuard<T>>
    where
        F: Fn(&QueryState<T>) + Send + Sync + 'static,
    {
        let shared = live(&self.inner.pipelines, &key.hash_key())?;
        let listener: Listener<T> = Arc::new(listener);
        Some(shared.publisher.subscribe(listener))
    }

    /// Latest state of the live query for `key`.
    pub fn get_snapshot(&self, key: &QueryKey) -> Option<QueryState<T>> {
        live(&self.inner.pipelines, &key.hash_key()).map(|shared| shared.publisher.snapshot())
    }

    /// Cached result for `key`, live or within its grace period.
    pub fn get_query_data(&self, key: &QueryKey) -> Option<Arc<T>> {
        self.inner
            .context
            .store
            .get(&key.hash_key())
            .and_then(|entry| entry.cached_result.clone())
    }

    /// Write a result for `key` as if it had just been fetched.
    ///
    /// Returns false when the key has no entry. Live consumers observe the
    /// new value.
    pub fn set_query_data(&self, key: &QueryKey, value: T) -> bool {
        self.inner.context.store.update(
            &key.hash_key(),
            EntryPatch::new()
                .result(Some(Arc::new(value)))
                .fetched_at(Some(Instant::now()))
                .stale(false),
        )
    }

    /// Number of executions currently running.
    pub fn fetching_count(&self) -> usize {
        self.inner.context.dedupe.in_flight()
    }
}

/// One consumer's handle on a query.
///
/// Every clone counts as a consumer; the pipeline stops once the last handle
/// for its key is dropped.
pub struct QueryHandle<T> {
    shared: Arc<PipelineShared<T>>,
}

impl<T> Clone for QueryHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> QueryHandle<T> {
    pub fn key(&self) -> &QueryKey {
        &self.shared.key
    }

    pub fn snapshot(&self) -> QueryState<T> {
        self.shared.publisher.snapshot()
    }

    /// Receiver over published states.
    pub fn watch(&self) -> watch::Receiver<QueryState<T>> {
        self.shared.publisher.watch()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerGuard<T>
    where
        F: Fn(&QueryState<T>) + Send + Sync + 'static,
    {
        self.shared.publisher.subscribe(Arc::new(listener))
    }

    /// Wait for the first published state satisfying `predicate`, starting
    /// with the current one.
    pub async fn wait_for(&self, predicate: impl FnMut(&QueryState<T>) -> bool) -> QueryState<T> {
        let mut states = self.watch();
        match states.wait_for(predicate).await {
            Ok(state) => state.clone(),
            // The publisher lives as long as `self`.
            Err(_) => self.snapshot(),
        }
    }

    /// Fetch now, even when the cached result is fresh.
    pub fn refetch(&self) {
        self.shared.trigger(Trigger::manual(self.shared.key.clone()));
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.modify_options(|options| options.enabled = enabled);
    }

    pub fn options(&self) -> QueryOptions<T> {
        self.shared.options()
    }

    pub fn set_options(&self, options: QueryOptions<T>) {
        self.shared.replace_options(options);
    }
}
