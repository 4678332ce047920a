//! Per-key fetch pipeline.
//!
//! One task per live query key. It turns triggers, option changes, network
//! and focus transitions, refetch timers and store changes into executions,
//! and publishes the resulting [`QueryState`] to every consumer of the key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use futures::stream::BoxStream;
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::dedupe::{Deduplicator, ExecutionEvent, Subscription};
use super::options::QueryOptions;
use super::retry::Retryer;
use super::scheduler::RefetchScheduler;
use super::state::{FetchStatus, QueryState, QueryStatus};
use super::trigger::{Trigger, TriggerReason};
use crate::cache::lock::lock_or_recover;
use crate::cache::{CacheEntry, CacheStore, EntryChanges, EntryPatch, QueryKey, RunnerGuard};
use crate::gate::NetworkGate;

const COMPONENT: &str = "query::pipeline";
pub(crate) const METRIC_FETCH_TOTAL: &str = "querycache_fetch_total";
pub(crate) const METRIC_CACHE_HIT_TOTAL: &str = "querycache_cache_hit_total";
pub(crate) const METRIC_FETCH_MS: &str = "querycache_fetch_ms";

/// Live pipelines by serialized key.
pub(crate) type PipelineRegistry<T> = DashMap<String, Weak<PipelineShared<T>>>;

/// Callback invoked with every published state.
pub type Listener<T> = Arc<dyn Fn(&QueryState<T>) + Send + Sync>;

/// Fans a pipeline's state out to watchers and callback listeners.
pub(crate) struct StatePublisher<T> {
    state: watch::Sender<QueryState<T>>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_listener: AtomicU64,
}

impl<T> StatePublisher<T> {
    fn new(initial: QueryState<T>) -> Self {
        Self {
            state: watch::Sender::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    fn publish(&self, state: &QueryState<T>) {
        self.state.send_replace(state.clone());
        // Listeners run outside the lock so they may subscribe or unsubscribe.
        let listeners: Vec<Listener<T>> = lock_or_recover(&self.listeners, COMPONENT, "publish")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(state);
        }
    }

    pub(crate) fn snapshot(&self) -> QueryState<T> {
        self.state.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<QueryState<T>> {
        self.state.subscribe()
    }

    pub(crate) fn subscribe(self: &Arc<Self>, listener: Listener<T>) -> ListenerGuard<T> {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock_or_recover(&self.listeners, COMPONENT, "subscribe").push((id, listener));
        ListenerGuard {
            id,
            publisher: Arc::downgrade(self),
        }
    }
}

/// Unsubscribes its listener when dropped.
pub struct ListenerGuard<T> {
    id: u64,
    publisher: Weak<StatePublisher<T>>,
}

impl<T> Drop for ListenerGuard<T> {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.upgrade() {
            lock_or_recover(&publisher.listeners, COMPONENT, "unsubscribe")
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Consumer-side half of a pipeline, shared by every handle on the key.
///
/// Dropping the last reference closes the trigger channel, which stops the
/// pipeline task.
pub(crate) struct PipelineShared<T> {
    pub(crate) key: QueryKey,
    pub(crate) hash: String,
    triggers: mpsc::UnboundedSender<Trigger>,
    options: watch::Sender<QueryOptions<T>>,
    pub(crate) publisher: Arc<StatePublisher<T>>,
    registry: Arc<PipelineRegistry<T>>,
}

impl<T> PipelineShared<T> {
    /// Deliver a trigger; false once the pipeline task is gone.
    pub(crate) fn trigger(&self, trigger: Trigger) -> bool {
        self.triggers.send(trigger).is_ok()
    }

    pub(crate) fn options(&self) -> QueryOptions<T> {
        self.options.borrow().clone()
    }

    pub(crate) fn replace_options(&self, options: QueryOptions<T>) {
        self.options.send_replace(options);
    }

    pub(crate) fn modify_options(&self, f: impl FnOnce(&mut QueryOptions<T>)) {
        self.options.send_modify(f);
    }
}

impl<T> Drop for PipelineShared<T> {
    fn drop(&mut self) {
        self.registry
            .remove_if(self.hash.as_str(), |_, pipeline| pipeline.strong_count() == 0);
    }
}

/// Look up a live pipeline without holding the registry lock afterwards.
pub(crate) fn live<T>(registry: &PipelineRegistry<T>, hash: &str) -> Option<Arc<PipelineShared<T>>> {
    registry.get(hash).and_then(|pipeline| pipeline.upgrade())
}

/// Build the execution factory for one key with the given options.
pub(crate) fn execution<T: Send + Sync + 'static>(
    key: &QueryKey,
    options: &QueryOptions<T>,
    gate: &NetworkGate,
) -> impl FnOnce() -> BoxStream<'static, ExecutionEvent<T>> + use<T> {
    let retryer = Retryer {
        policy: options.retry.clone(),
        delay: options.retry_delay,
        network_mode: options.network_mode,
        gate: gate.clone(),
        label: key.to_string(),
    };
    let query_fn = Arc::clone(&options.query_fn);
    let key = key.clone();
    move || retryer.run(Box::new(move || query_fn(&key)))
}

/// Services shared by every pipeline of a client.
pub(crate) struct PipelineContext<T> {
    pub store: CacheStore<T>,
    pub dedupe: Deduplicator<T>,
    pub gate: NetworkGate,
}

impl<T> Clone for PipelineContext<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            dedupe: self.dedupe.clone(),
            gate: self.gate.clone(),
        }
    }
}

/// Start a pipeline for `key` and return its shared half.
///
/// The pipeline immediately receives a mount trigger. Must be called within
/// a Tokio runtime.
pub(crate) fn spawn<T: Send + Sync + 'static>(
    context: PipelineContext<T>,
    key: QueryKey,
    options: QueryOptions<T>,
    registry: Arc<PipelineRegistry<T>>,
) -> Arc<PipelineShared<T>> {
    let hash = key.hash_key();
    let runner = context.store.add_runner(&key);
    let cached = context
        .store
        .get(&hash)
        .and_then(|entry| entry.cached_result.clone());
    let state = QueryState::from_cached(cached);
    let entry_changes = context.store.change_stream(&hash);

    let publisher = Arc::new(StatePublisher::new(state.clone()));
    let (triggers_tx, triggers) = mpsc::unbounded_channel();
    let (options_tx, options_rx) = watch::channel(options.clone());
    let _ = triggers_tx.send(Trigger::mount(key.clone()));

    let pipeline = Pipeline {
        key: key.clone(),
        hash: hash.clone(),
        store: context.store,
        dedupe: context.dedupe,
        gate: context.gate,
        options: options_rx,
        current: options,
        triggers,
        entry_changes,
        publisher: Arc::clone(&publisher),
        scheduler: RefetchScheduler::new(),
        runner: Some(runner),
        state,
        execution: None,
    };
    debug!(query_key = %key, "Pipeline started");
    tokio::spawn(pipeline.run());

    Arc::new(PipelineShared {
        key,
        hash,
        triggers: triggers_tx,
        options: options_tx,
        publisher,
        registry,
    })
}

struct Rollback<T> {
    result: Option<Arc<T>>,
    fetched_at: Option<Instant>,
    is_stale: bool,
    data: Option<Arc<T>>,
    data_updated_at: Option<OffsetDateTime>,
}

struct Execution<T> {
    subscription: Subscription<T>,
    reason: TriggerReason,
    started_at: Instant,
    rollback: Rollback<T>,
    wrote: bool,
}

struct Pipeline<T> {
    key: QueryKey,
    hash: String,
    store: CacheStore<T>,
    dedupe: Deduplicator<T>,
    gate: NetworkGate,
    options: watch::Receiver<QueryOptions<T>>,
    current: QueryOptions<T>,
    triggers: mpsc::UnboundedReceiver<Trigger>,
    entry_changes: Option<EntryChanges<T>>,
    publisher: Arc<StatePublisher<T>>,
    scheduler: RefetchScheduler,
    runner: Option<RunnerGuard<T>>,
    state: QueryState<T>,
    execution: Option<Execution<T>>,
}

impl<T: Send + Sync + 'static> Pipeline<T> {
    async fn run(mut self) {
        let mut online = self.gate.online_signal();
        let mut focused = self.gate.focus_signal();

        loop {
            tokio::select! {
                trigger = self.triggers.recv() => match trigger {
                    Some(trigger) => self.handle_trigger(trigger),
                    None => break,
                },
                changed = self.options.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply_options();
                }
                event = next_event(&mut self.execution) => self.handle_event(event),
                () = self.scheduler.fired() => {
                    self.handle_trigger(Trigger::new(self.key.clone(), TriggerReason::Interval));
                }
                Ok(()) = online.changed() => {
                    let is_online = *online.borrow_and_update();
                    if is_online && self.current.refetch_on_reconnect {
                        self.handle_trigger(Trigger::new(self.key.clone(), TriggerReason::Reconnect));
                    }
                }
                Ok(()) = focused.changed() => {
                    let is_focused = *focused.borrow_and_update();
                    if is_focused && self.current.refetch_on_focus {
                        self.handle_trigger(Trigger::new(self.key.clone(), TriggerReason::Focus));
                    }
                }
                change = next_entry_change(&mut self.entry_changes) => match change {
                    Some(entry) => self.handle_entry_change(entry),
                    None => self.entry_changes = None,
                },
            }
        }

        self.shutdown();
    }

    fn handle_trigger(&mut self, trigger: Trigger) {
        debug!(
            query_key = %self.key,
            trigger_id = %trigger.id,
            reason = %trigger.reason,
            ignore_stale = trigger.ignore_stale,
            "Trigger received"
        );

        if !self.current.enabled {
            debug!(query_key = %self.key, reason = %trigger.reason, "Trigger ignored, query disabled");
            return;
        }
        if self.execution.is_some() {
            debug!(query_key = %self.key, reason = %trigger.reason, "Trigger coalesced into running execution");
            return;
        }

        let entry = self.store.get(&self.hash);
        if !trigger.ignore_stale {
            if let Some(entry) = entry
                .as_ref()
                .filter(|entry| entry.is_fresh(self.current.stale_time, Instant::now()))
            {
                counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
                self.serve_cached(entry);
                return;
            }
        }

        self.start_execution(trigger.reason, entry);
    }

    fn serve_cached(&mut self, entry: &CacheEntry<T>) {
        debug!(query_key = %self.key, "Serving fresh cached result");
        if !same_data(&self.state.data, &entry.cached_result) {
            self.state.data = entry.cached_result.clone();
            self.state.data_updated_at = Some(OffsetDateTime::now_utc());
        }
        self.state.status = QueryStatus::Success;
        self.state.error = None;
        self.state.fetch_status = FetchStatus::Idle;
        self.state.is_paused = false;
        self.publish();
        if !self.scheduler.is_armed() {
            self.scheduler.schedule(self.current.refetch_interval);
        }
    }

    fn start_execution(&mut self, reason: TriggerReason, entry: Option<Arc<CacheEntry<T>>>) {
        self.scheduler.cancel();
        counter!(METRIC_FETCH_TOTAL).increment(1);

        let subscription = self
            .dedupe
            .dedupe(&self.hash, execution(&self.key, &self.current, &self.gate));
        let rollback = Rollback {
            result: entry.as_ref().and_then(|entry| entry.cached_result.clone()),
            fetched_at: entry.as_ref().and_then(|entry| entry.last_fetched_at),
            is_stale: entry.as_ref().is_some_and(|entry| entry.is_stale),
            data: self.state.data.clone(),
            data_updated_at: self.state.data_updated_at,
        };
        self.execution = Some(Execution {
            subscription,
            reason,
            started_at: Instant::now(),
            rollback,
            wrote: false,
        });

        debug!(query_key = %self.key, %reason, "Fetch started");
        self.state.fetch_status = FetchStatus::Fetching;
        self.state.failure_count = 0;
        self.state.failure_reason = None;
        self.publish();
    }

    fn handle_event(&mut self, event: ExecutionEvent<T>) {
        match event {
            ExecutionEvent::Value(value) => self.receive_value(value),
            ExecutionEvent::Retry {
                failure_count,
                error,
            } => {
                self.state.failure_count = failure_count;
                self.state.failure_reason = Some(error);
                self.publish();
            }
            ExecutionEvent::Paused => {
                self.state.is_paused = true;
                self.publish();
            }
            ExecutionEvent::Resumed => {
                self.state.is_paused = false;
                self.publish();
            }
            ExecutionEvent::Failed(error) => {
                let Some(execution) = self.execution.take() else {
                    return;
                };
                if execution.wrote {
                    let rollback = execution.rollback;
                    let restored = self.store.update(
                        &self.hash,
                        EntryPatch::new()
                            .result(rollback.result)
                            .fetched_at(rollback.fetched_at)
                            .stale(rollback.is_stale),
                    );
                    if !restored {
                        debug!(query_key = %self.key, "Rollback left no cache entry to restore");
                    }
                    self.state.data = rollback.data;
                    self.state.data_updated_at = rollback.data_updated_at;
                }
                warn!(query_key = %self.key, error = %error, "Fetch failed");
                self.state.status = QueryStatus::Error;
                self.state.error = Some(error.clone());
                self.state.failure_count += 1;
                self.state.failure_reason = Some(error);
                self.state.fetch_status = FetchStatus::Idle;
                self.state.is_paused = false;
                self.publish();
            }
            ExecutionEvent::Complete => {
                let Some(execution) = self.execution.take() else {
                    return;
                };
                let elapsed = execution.started_at.elapsed();
                histogram!(METRIC_FETCH_MS).record(elapsed.as_secs_f64() * 1000.0);
                info!(
                    query_key = %self.key,
                    reason = %execution.reason,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Fetch completed"
                );
                self.state.fetch_status = FetchStatus::Idle;
                self.state.is_paused = false;
                self.publish();
                if self.state.status == QueryStatus::Success {
                    self.scheduler.schedule(self.current.refetch_interval);
                }
            }
        }
    }

    fn receive_value(&mut self, value: Arc<T>) {
        let Some(execution) = self.execution.as_mut() else {
            return;
        };
        if !self.current.cache_time.is_zero() {
            self.store.update(
                &self.hash,
                EntryPatch::new()
                    .result(Some(Arc::clone(&value)))
                    .fetched_at(Some(Instant::now()))
                    .stale(false),
            );
            execution.wrote = true;
        }

        self.state.data = Some(value);
        self.state.data_updated_at = Some(OffsetDateTime::now_utc());
        self.state.status = QueryStatus::Success;
        self.state.error = None;
        self.state.failure_count = 0;
        self.state.failure_reason = None;
        self.state.is_paused = false;
        self.publish();
    }

    /// Adopt results written to the store by someone else.
    fn handle_entry_change(&mut self, entry: Option<Arc<CacheEntry<T>>>) {
        let Some(entry) = entry else {
            debug!(query_key = %self.key, "Cache entry removed under live pipeline");
            return;
        };
        let Some(result) = entry.cached_result.as_ref() else {
            return;
        };
        if same_data(&self.state.data, &entry.cached_result) {
            return;
        }

        debug!(query_key = %self.key, "Adopting externally written result");
        self.state.data = Some(Arc::clone(result));
        self.state.data_updated_at = Some(OffsetDateTime::now_utc());
        self.state.status = QueryStatus::Success;
        self.state.error = None;
        self.publish();
    }

    fn apply_options(&mut self) {
        let next = self.options.borrow_and_update().clone();
        let previous = std::mem::replace(&mut self.current, next);

        if previous.enabled && !self.current.enabled {
            self.scheduler.cancel();
            if self.execution.take().is_some() {
                debug!(query_key = %self.key, "Execution cancelled, query disabled");
            }
            self.state.fetch_status = FetchStatus::Idle;
            self.state.is_paused = false;
            self.publish();
            return;
        }

        if !previous.enabled && self.current.enabled {
            self.handle_trigger(Trigger::new(self.key.clone(), TriggerReason::Enabled));
            return;
        }

        if previous.refetch_interval != self.current.refetch_interval {
            match self.current.refetch_interval {
                None => self.scheduler.cancel(),
                Some(_) if self.execution.is_none() && self.state.is_success() => {
                    self.scheduler.schedule(self.current.refetch_interval);
                }
                Some(_) => {}
            }
        }
    }

    fn publish(&self) {
        self.publisher.publish(&self.state);
    }

    fn shutdown(mut self) {
        self.execution = None;
        self.scheduler.cancel();
        if let Some(runner) = self.runner.take() {
            runner.release_after(self.current.cache_time);
        }
        debug!(query_key = %self.key, "Pipeline stopped");
    }
}

fn same_data<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

async fn next_event<T>(execution: &mut Option<Execution<T>>) -> ExecutionEvent<T> {
    match execution {
        Some(execution) => execution
            .subscription
            .next()
            .await
            .unwrap_or(ExecutionEvent::Complete),
        None => std::future::pending().await,
    }
}

/// Next snapshot of the watched entry; `None` once the stream is closed.
async fn next_entry_change<T>(
    changes: &mut Option<EntryChanges<T>>,
) -> Option<Option<Arc<CacheEntry<T>>>> {
    match changes {
        Some(changes) => match changes.changed().await {
            Ok(()) => Some(changes.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn listeners_receive_published_state_until_dropped() {
        let publisher = Arc::new(StatePublisher::new(QueryState::<u32>::default()));
        let seen = Arc::new(AtomicUsize::new(0));
        let guard = publisher.subscribe({
            let seen = Arc::clone(&seen);
            Arc::new(move |_state: &QueryState<u32>| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        });

        publisher.publish(&QueryState::from_cached(Some(Arc::new(1))));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(publisher.snapshot().is_success());

        drop(guard);
        publisher.publish(&QueryState::default());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn same_data_compares_identity() {
        let a = Some(Arc::new(1));
        let b = Some(Arc::new(1));
        assert!(same_data(&a, &a.clone()));
        assert!(!same_data(&a, &b));
        assert!(same_data::<u32>(&None, &None));
    }
}
