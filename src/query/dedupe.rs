//! In-flight execution deduplication.
//!
//! At most one execution runs per serialized key. Later requesters join the
//! running execution, receive the most recent value it produced, and then
//! every event that follows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use futures::stream::BoxStream;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::cache::lock::lock_or_recover;
use crate::error::QueryError;

const COMPONENT: &str = "query::dedupe";
const METRIC_DEDUPE_JOIN_TOTAL: &str = "querycache_dedupe_join_total";

/// Events produced by a shared execution.
#[derive(Debug)]
pub enum ExecutionEvent<T> {
    /// A value produced by the source.
    Value(Arc<T>),
    /// An attempt failed and another one will follow.
    Retry {
        failure_count: u32,
        error: QueryError,
    },
    /// The execution is waiting for the network.
    Paused,
    /// The network came back; attempts continue.
    Resumed,
    /// Terminal failure; no further events.
    Failed(QueryError),
    /// The source finished; no further events.
    Complete,
}

impl<T> Clone for ExecutionEvent<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(value) => Self::Value(Arc::clone(value)),
            Self::Retry {
                failure_count,
                error,
            } => Self::Retry {
                failure_count: *failure_count,
                error: error.clone(),
            },
            Self::Paused => Self::Paused,
            Self::Resumed => Self::Resumed,
            Self::Failed(error) => Self::Failed(error.clone()),
            Self::Complete => Self::Complete,
        }
    }
}

impl<T> ExecutionEvent<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Complete)
    }
}

type Slots<T> = DashMap<String, Arc<Slot<T>>>;

struct SlotState<T> {
    last: Option<Arc<T>>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<ExecutionEvent<T>>>,
    next_subscriber: u64,
    finished: bool,
}

struct Slot<T> {
    id: u64,
    state: Mutex<SlotState<T>>,
    task: Mutex<Option<AbortHandle>>,
}

impl<T> Slot<T> {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(SlotState {
                last: None,
                subscribers: HashMap::new(),
                next_subscriber: 0,
                finished: false,
            }),
            task: Mutex::new(None),
        }
    }

    /// Register a subscriber, replaying the latest buffered value.
    fn join(&self) -> (u64, mpsc::UnboundedReceiver<ExecutionEvent<T>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = lock_or_recover(&self.state, COMPONENT, "join");
        if let Some(last) = &state.last {
            let _ = sender.send(ExecutionEvent::Value(Arc::clone(last)));
        }
        let subscriber = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(subscriber, sender);
        (subscriber, receiver)
    }

    /// Remove a subscriber; true when nobody is left on a live execution.
    fn leave(&self, subscriber: u64) -> bool {
        let mut state = lock_or_recover(&self.state, COMPONENT, "leave");
        state.subscribers.remove(&subscriber);
        state.subscribers.is_empty() && !state.finished
    }

    fn is_abandoned(&self) -> bool {
        let state = lock_or_recover(&self.state, COMPONENT, "is_abandoned");
        state.subscribers.is_empty() && !state.finished
    }

    fn broadcast(&self, event: ExecutionEvent<T>) {
        let mut state = lock_or_recover(&self.state, COMPONENT, "broadcast");
        if let ExecutionEvent::Value(value) = &event {
            state.last = Some(Arc::clone(value));
        }
        state
            .subscribers
            .retain(|_, subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn finish(&self, event: ExecutionEvent<T>) {
        let subscribers = {
            let mut state = lock_or_recover(&self.state, COMPONENT, "finish");
            state.finished = true;
            std::mem::take(&mut state.subscribers)
        };
        for subscriber in subscribers.into_values() {
            let _ = subscriber.send(event.clone());
        }
    }

    fn set_task(&self, handle: AbortHandle) {
        *lock_or_recover(&self.task, COMPONENT, "set_task") = Some(handle);
    }

    fn cancel(&self) {
        lock_or_recover(&self.state, COMPONENT, "cancel").finished = true;
        if let Some(handle) = lock_or_recover(&self.task, COMPONENT, "cancel").take() {
            handle.abort();
        }
    }
}

/// Registry of shared in-flight executions.
pub struct Deduplicator<T> {
    slots: Arc<Slots<T>>,
    next_slot: Arc<AtomicU64>,
}

impl<T> Clone for Deduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            next_slot: Arc::clone(&self.next_slot),
        }
    }
}

impl<T> Default for Deduplicator<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            next_slot: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<T: Send + Sync + 'static> Deduplicator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the execution running for `key`, or start one with `execute`.
    ///
    /// `execute` is invoked only when no slot exists. The slot is removed as
    /// soon as the execution completes or fails, or when the last
    /// [`Subscription`] is dropped, which also aborts the execution.
    pub fn dedupe<F>(&self, key: &str, execute: F) -> Subscription<T>
    where
        F: FnOnce() -> BoxStream<'static, ExecutionEvent<T>>,
    {
        let (slot, subscriber, events, created) = match self.slots.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let slot = Arc::clone(occupied.get());
                let (subscriber, events) = slot.join();
                (slot, subscriber, events, false)
            }
            Entry::Vacant(vacant) => {
                let slot = Arc::new(Slot::new(self.next_slot.fetch_add(1, Ordering::Relaxed)));
                let (subscriber, events) = slot.join();
                vacant.insert(Arc::clone(&slot));
                (slot, subscriber, events, true)
            }
        };

        if created {
            debug!(query_key = key, slot = slot.id, "Starting shared execution");
            let source = execute();
            let handle = tokio::spawn(drive(
                Arc::clone(&self.slots),
                key.to_string(),
                Arc::clone(&slot),
                source,
            ));
            slot.set_task(handle.abort_handle());
        } else {
            debug!(query_key = key, slot = slot.id, "Joined shared execution");
            counter!(METRIC_DEDUPE_JOIN_TOTAL).increment(1);
        }

        Subscription {
            key: key.to_string(),
            slot,
            subscriber,
            events,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Whether an execution is currently running for `key`.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Number of executions currently running.
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }
}

async fn drive<T>(
    slots: Arc<Slots<T>>,
    key: String,
    slot: Arc<Slot<T>>,
    mut source: BoxStream<'static, ExecutionEvent<T>>,
) {
    let mut terminal = ExecutionEvent::Complete;
    while let Some(event) = source.next().await {
        if event.is_terminal() {
            terminal = event;
            break;
        }
        slot.broadcast(event);
    }

    // Drop the slot before telling subscribers, so a subscriber reacting to
    // the terminal event starts a fresh execution instead of rejoining.
    slots.remove_if(key.as_str(), |_, current| current.id == slot.id);
    debug!(query_key = %key, slot = slot.id, "Shared execution settled");
    slot.finish(terminal);
}

/// One requester's view of a shared execution.
pub struct Subscription<T> {
    key: String,
    slot: Arc<Slot<T>>,
    subscriber: u64,
    events: mpsc::UnboundedReceiver<ExecutionEvent<T>>,
    slots: Arc<Slots<T>>,
}

impl<T> Subscription<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next event; `None` once the execution is gone.
    pub async fn next(&mut self) -> Option<ExecutionEvent<T>> {
        self.events.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if !self.slot.leave(self.subscriber) {
            return;
        }

        let removed = self.slots.remove_if(self.key.as_str(), |_, current| {
            current.id == self.slot.id && current.is_abandoned()
        });
        if removed.is_some() {
            debug!(query_key = %self.key, slot = self.slot.id, "Shared execution cancelled");
            self.slot.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::stream;
    use tokio::sync::Notify;

    use super::*;

    fn counting_source(
        calls: &Arc<AtomicUsize>,
        release: &Arc<Notify>,
        value: u32,
    ) -> impl FnOnce() -> BoxStream<'static, ExecutionEvent<u32>> {
        let calls = Arc::clone(calls);
        let release = Arc::clone(release);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(stream::once(async move {
                release.notified().await;
                ExecutionEvent::Value(Arc::new(value))
            }))
        }
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_execution() {
        let dedupe = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut first = dedupe.dedupe("k", counting_source(&calls, &release, 1));
        let mut second = dedupe.dedupe("k", counting_source(&calls, &release, 2));
        assert_eq!(dedupe.in_flight(), 1);

        release.notify_one();

        assert!(matches!(first.next().await, Some(ExecutionEvent::Value(v)) if *v == 1));
        assert!(matches!(second.next().await, Some(ExecutionEvent::Value(v)) if *v == 1));
        assert!(matches!(first.next().await, Some(ExecutionEvent::Complete)));
        assert!(matches!(second.next().await, Some(ExecutionEvent::Complete)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!dedupe.is_in_flight("k"));
    }

    #[tokio::test]
    async fn late_joiner_receives_only_latest_value() {
        let dedupe = Deduplicator::new();
        let (sender, receiver) = mpsc::unbounded_channel::<ExecutionEvent<u32>>();
        let mut receiver = Some(receiver);

        let mut early = dedupe.dedupe("k", || {
            let receiver = receiver.take().expect("source created once");
            Box::pin(stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|event| (event, receiver))
            }))
        });

        sender.send(ExecutionEvent::Value(Arc::new(1))).expect("source alive");
        sender.send(ExecutionEvent::Value(Arc::new(2))).expect("source alive");
        assert!(matches!(early.next().await, Some(ExecutionEvent::Value(v)) if *v == 1));
        assert!(matches!(early.next().await, Some(ExecutionEvent::Value(v)) if *v == 2));

        let mut late = dedupe.dedupe("k", || panic!("must join the running execution"));
        assert!(matches!(late.next().await, Some(ExecutionEvent::Value(v)) if *v == 2));

        sender.send(ExecutionEvent::Value(Arc::new(3))).expect("source alive");
        assert!(matches!(late.next().await, Some(ExecutionEvent::Value(v)) if *v == 3));
        assert!(matches!(early.next().await, Some(ExecutionEvent::Value(v)) if *v == 3));
    }

    #[tokio::test]
    async fn failure_removes_slot_before_notifying() {
        let dedupe: Deduplicator<u32> = Deduplicator::new();
        let mut subscription = dedupe.dedupe("k", || {
            Box::pin(stream::iter([ExecutionEvent::Failed(QueryError::failed("down"))]))
        });

        assert!(matches!(subscription.next().await, Some(ExecutionEvent::Failed(_))));
        assert!(!dedupe.is_in_flight("k"));
    }

    #[tokio::test]
    async fn dropping_last_subscriber_cancels_execution() {
        let dedupe = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let first = dedupe.dedupe("k", counting_source(&calls, &release, 1));
        let second = dedupe.dedupe("k", counting_source(&calls, &release, 2));

        drop(first);
        assert!(dedupe.is_in_flight("k"));

        drop(second);
        assert!(!dedupe.is_in_flight("k"));

        // A new request starts a fresh execution.
        let mut third = dedupe.dedupe("k", counting_source(&calls, &release, 3));
        release.notify_one();
        let event = tokio::time::timeout(Duration::from_secs(1), third.next())
            .await
            .expect("fresh execution settles");
        assert!(matches!(event, Some(ExecutionEvent::Value(v)) if *v == 3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
