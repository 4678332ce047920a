//! Cache entry storage.
//!
//! Maps serialized query keys to immutable entry snapshots. Entries live only
//! while at least one runner (a pipeline, or a grace holder after the last
//! consumer left) references them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{broadcast, watch};
use tokio::time::{Duration, Instant};
use tracing::debug;

use super::keys::QueryKey;
use super::lock::lock_or_recover;

const COMPONENT: &str = "cache::store";
const EVENT_CAPACITY: usize = 256;

/// Immutable snapshot of one cache entry.
#[derive(Debug)]
pub struct CacheEntry<T> {
    pub key: QueryKey,
    pub is_stale: bool,
    pub last_fetched_at: Option<Instant>,
    pub cached_result: Option<Arc<T>>,
}

impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            is_stale: self.is_stale,
            last_fetched_at: self.last_fetched_at,
            cached_result: self.cached_result.clone(),
        }
    }
}

impl<T> CacheEntry<T> {
    pub fn new(key: QueryKey) -> Self {
        Self {
            key,
            is_stale: false,
            last_fetched_at: None,
            cached_result: None,
        }
    }

    /// True when a result exists, nobody flagged it stale, and it is younger
    /// than `stale_time`.
    pub fn is_fresh(&self, stale_time: Duration, now: Instant) -> bool {
        if self.is_stale || self.cached_result.is_none() {
            return false;
        }
        match self.last_fetched_at {
            Some(fetched_at) => now.saturating_duration_since(fetched_at) < stale_time,
            None => false,
        }
    }

    /// Field-by-field comparison; results compare by identity.
    pub fn shallow_eq(&self, other: &Self) -> bool {
        self.is_stale == other.is_stale
            && self.last_fetched_at == other.last_fetched_at
            && match (&self.cached_result, &other.cached_result) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
    }
}

/// Partial update applied to an entry; unset fields are left untouched.
#[derive(Debug)]
pub struct EntryPatch<T> {
    pub is_stale: Option<bool>,
    pub last_fetched_at: Option<Option<Instant>>,
    pub cached_result: Option<Option<Arc<T>>>,
}

impl<T> Default for EntryPatch<T> {
    fn default() -> Self {
        Self {
            is_stale: None,
            last_fetched_at: None,
            cached_result: None,
        }
    }
}

impl<T> Clone for EntryPatch<T> {
    fn clone(&self) -> Self {
        Self {
            is_stale: self.is_stale,
            last_fetched_at: self.last_fetched_at,
            cached_result: self.cached_result.clone(),
        }
    }
}

impl<T> EntryPatch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stale(mut self, is_stale: bool) -> Self {
        self.is_stale = Some(is_stale);
        self
    }

    pub fn fetched_at(mut self, at: Option<Instant>) -> Self {
        self.last_fetched_at = Some(at);
        self
    }

    pub fn result(mut self, result: Option<Arc<T>>) -> Self {
        self.cached_result = Some(result);
        self
    }

    pub fn apply(&self, entry: &CacheEntry<T>) -> CacheEntry<T> {
        CacheEntry {
            key: entry.key.clone(),
            is_stale: self.is_stale.unwrap_or(entry.is_stale),
            last_fetched_at: self.last_fetched_at.unwrap_or(entry.last_fetched_at),
            cached_result: match &self.cached_result {
                Some(result) => result.clone(),
                None => entry.cached_result.clone(),
            },
        }
    }
}

/// Store-wide change notification; one per mutating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Entries whose snapshot changed.
    Updated { keys: Vec<String> },
    /// An entry was deleted, explicitly or by its last runner leaving.
    Removed { key: String },
}

/// Receiver over one entry's snapshots; yields `None` once the entry is gone.
pub type EntryChanges<T> = watch::Receiver<Option<Arc<CacheEntry<T>>>>;

struct Record<T> {
    entry: Arc<CacheEntry<T>>,
    /// Distinguishes a re-created entry from a deleted one under the same key.
    generation: u64,
    runners: usize,
    changes: watch::Sender<Option<Arc<CacheEntry<T>>>>,
}

impl<T> Record<T> {
    fn new(entry: CacheEntry<T>, generation: u64) -> Self {
        let entry = Arc::new(entry);
        let (changes, _) = watch::channel(Some(Arc::clone(&entry)));
        Self {
            entry,
            generation,
            runners: 0,
            changes,
        }
    }

    /// Swap in `next` when it differs; returns whether subscribers were notified.
    fn replace(&mut self, next: CacheEntry<T>) -> bool {
        if self.entry.shallow_eq(&next) {
            return false;
        }
        self.entry = Arc::new(next);
        self.changes.send_replace(Some(Arc::clone(&self.entry)));
        true
    }

    fn close(self) {
        self.changes.send_replace(None);
    }
}

struct StoreInner<T> {
    records: Mutex<HashMap<String, Record<T>>>,
    events: broadcast::Sender<StoreEvent>,
    next_generation: AtomicU64,
}

/// Shared cache store. Cloning yields another handle to the same map.
pub struct CacheStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for CacheStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CacheStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CacheStore<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                records: Mutex::new(HashMap::new()),
                events,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry<T>>> {
        lock_or_recover(&self.inner.records, COMPONENT, "get")
            .get(key)
            .map(|record| Arc::clone(&record.entry))
    }

    /// Watch one entry. Returns `None` when the entry does not exist.
    pub fn change_stream(&self, key: &str) -> Option<EntryChanges<T>> {
        lock_or_recover(&self.inner.records, COMPONENT, "change_stream")
            .get(key)
            .map(|record| record.changes.subscribe())
    }

    /// Subscribe to store-wide change events.
    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Replace an existing entry's snapshot. Entries are created by
    /// [`add_runner`](Self::add_runner), so this is a no-op for absent keys.
    pub fn set(&self, key: &str, entry: CacheEntry<T>) -> bool {
        self.update_with(key, |_| entry)
    }

    /// Apply a partial update to one entry. No-op if the key is absent.
    pub fn update(&self, key: &str, patch: EntryPatch<T>) -> bool {
        self.update_with(key, |entry| patch.apply(entry))
    }

    /// Replace one entry with the result of `f`. No-op if the key is absent.
    ///
    /// Returns whether the snapshot changed.
    pub fn update_with(
        &self,
        key: &str,
        f: impl FnOnce(&CacheEntry<T>) -> CacheEntry<T>,
    ) -> bool {
        let changed = {
            let mut records = lock_or_recover(&self.inner.records, COMPONENT, "update");
            match records.get_mut(key) {
                Some(record) => {
                    let next = f(record.entry.as_ref());
                    record.replace(next)
                }
                None => false,
            }
        };

        if changed {
            self.emit(StoreEvent::Updated {
                keys: vec![key.to_string()],
            });
        }
        changed
    }

    /// Patch every entry matching `predicate` in one pass.
    ///
    /// Returns the keys that matched, whether or not their snapshot changed.
    /// Emits a single [`StoreEvent::Updated`] covering the changed entries.
    pub fn update_many(
        &self,
        patch: EntryPatch<T>,
        predicate: impl Fn(&CacheEntry<T>) -> bool,
    ) -> Vec<String> {
        let mut matched = Vec::new();
        let mut changed = Vec::new();
        {
            let mut records = lock_or_recover(&self.inner.records, COMPONENT, "update_many");
            for (key, record) in records.iter_mut() {
                if !predicate(record.entry.as_ref()) {
                    continue;
                }
                matched.push(key.clone());
                let next = patch.apply(&record.entry);
                if record.replace(next) {
                    changed.push(key.clone());
                }
            }
        }

        if !changed.is_empty() {
            self.emit(StoreEvent::Updated { keys: changed });
        }
        matched
    }

    /// Remove an entry regardless of its runners.
    ///
    /// Guards issued for the removed entry become inert; they never touch an
    /// entry re-created under the same key.
    pub fn delete(&self, key: &str) -> bool {
        let removed = lock_or_recover(&self.inner.records, COMPONENT, "delete").remove(key);
        match removed {
            Some(record) => {
                record.close();
                debug!(query_key = key, "Cache entry deleted");
                self.emit(StoreEvent::Removed {
                    key: key.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub fn runner_count(&self, key: &str) -> usize {
        lock_or_recover(&self.inner.records, COMPONENT, "runner_count")
            .get(key)
            .map_or(0, |record| record.runners)
    }

    pub fn keys(&self) -> Vec<String> {
        lock_or_recover(&self.inner.records, COMPONENT, "keys")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner.records, COMPONENT, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine; the broadcast is best-effort observation.
        let _ = self.inner.events.send(event);
    }
}

impl<T: Send + Sync + 'static> CacheStore<T> {
    /// Register a runner for `key`, creating the entry when absent.
    ///
    /// Dropping the returned guard releases the reference; the entry is
    /// deleted when the last reference goes.
    pub fn add_runner(&self, key: &QueryKey) -> RunnerGuard<T> {
        let hash = key.hash_key();
        let generation = {
            let mut records = lock_or_recover(&self.inner.records, COMPONENT, "add_runner");
            let record = records.entry(hash.clone()).or_insert_with(|| {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                Record::new(CacheEntry::new(key.clone()), generation)
            });
            record.runners += 1;
            record.generation
        };

        RunnerGuard {
            key: hash,
            generation,
            store: Arc::downgrade(&self.inner),
        }
    }
}

/// Disposer returned by [`CacheStore::add_runner`].
pub struct RunnerGuard<T> {
    key: String,
    generation: u64,
    store: Weak<StoreInner<T>>,
}

impl<T> RunnerGuard<T> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T: Send + Sync + 'static> RunnerGuard<T> {
    /// Keep the entry alive for `grace`, then release it.
    ///
    /// A zero grace releases immediately. Must be called within a Tokio runtime.
    pub fn release_after(self, grace: Duration) {
        if grace.is_zero() {
            return;
        }
        debug!(query_key = %self.key, grace_ms = grace.as_millis() as u64, "Cache entry retained");
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            drop(self);
        });
    }
}

impl<T> Drop for RunnerGuard<T> {
    fn drop(&mut self) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };

        let removed = {
            let mut records = lock_or_recover(&inner.records, COMPONENT, "remove_runner");
            let exhausted = match records.get_mut(&self.key) {
                Some(record) if record.generation == self.generation => {
                    record.runners = record.runners.saturating_sub(1);
                    record.runners == 0
                }
                Some(_) => {
                    debug!(query_key = %self.key, "Runner outlived a deleted entry");
                    false
                }
                None => false,
            };
            if exhausted {
                records.remove(&self.key)
            } else {
                None
            }
        };

        if let Some(record) = removed {
            record.close();
            debug!(query_key = %self.key, "Cache entry released by last runner");
            let _ = inner.events.send(StoreEvent::Removed {
                key: self.key.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::query_key;

    fn store_with(key: &QueryKey) -> (CacheStore<u32>, RunnerGuard<u32>) {
        let store = CacheStore::new();
        let guard = store.add_runner(key);
        (store, guard)
    }

    #[test]
    fn entry_lives_while_runners_hold_it() {
        let key = query_key!["todos"];
        let (store, first) = store_with(&key);
        let second = store.add_runner(&key);

        assert_eq!(store.runner_count(&key.hash_key()), 2);

        drop(first);
        assert!(store.get(&key.hash_key()).is_some());

        drop(second);
        assert!(store.get(&key.hash_key()).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn guards_of_deleted_entry_leave_recreated_entry_alone() {
        let key = query_key!["todos"];
        let hash = key.hash_key();
        let (store, stale_first) = store_with(&key);
        let stale_second = store.add_runner(&key);

        assert!(store.delete(&hash));
        let live = store.add_runner(&key);
        assert_eq!(store.runner_count(&hash), 1);

        drop(stale_first);
        drop(stale_second);
        assert_eq!(store.runner_count(&hash), 1);
        assert!(store.get(&hash).is_some());

        drop(live);
        assert!(store.is_empty());
    }

    #[test]
    fn release_emits_removed_event() {
        let key = query_key!["todos"];
        let (store, guard) = store_with(&key);
        let mut events = store.events();

        drop(guard);

        assert_eq!(
            events.try_recv().expect("removal event"),
            StoreEvent::Removed {
                key: key.hash_key()
            }
        );
    }

    #[test]
    fn update_is_noop_for_absent_key() {
        let store: CacheStore<u32> = CacheStore::new();
        assert!(!store.update("[\"missing\"]", EntryPatch::new().stale(true)));
        assert!(!store.set("[\"missing\"]", CacheEntry::new(query_key!["missing"])));
        assert!(store.is_empty());
    }

    #[test]
    fn update_notifies_once_and_skips_identical_snapshots() {
        let key = query_key!["todos"];
        let (store, _guard) = store_with(&key);
        let hash = key.hash_key();
        let mut changes = store.change_stream(&hash).expect("entry exists");
        changes.mark_unchanged();
        let mut events = store.events();

        let value = Arc::new(7);
        assert!(store.update(
            &hash,
            EntryPatch::new()
                .result(Some(Arc::clone(&value)))
                .fetched_at(Some(Instant::now()))
        ));
        assert!(changes.has_changed().expect("entry alive"));
        changes.mark_unchanged();
        assert!(matches!(events.try_recv(), Ok(StoreEvent::Updated { .. })));

        // Same result identity and flags: distinct-until-changed suppresses it.
        assert!(!store.update(&hash, EntryPatch::new().result(Some(value))));
        assert!(!changes.has_changed().expect("entry alive"));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn update_many_marks_matching_entries_in_one_event() {
        let store: CacheStore<u32> = CacheStore::new();
        let _a = store.add_runner(&query_key!["todos", 1]);
        let _b = store.add_runner(&query_key!["todos", 2]);
        let _c = store.add_runner(&query_key!["users"]);
        let mut events = store.events();

        let matched = store.update_many(EntryPatch::new().stale(true), |entry| {
            entry.key.parts().first() == Some(&serde_json::json!("todos"))
        });

        assert_eq!(matched.len(), 2);
        match events.try_recv().expect("one batched event") {
            StoreEvent::Updated { keys } => assert_eq!(keys.len(), 2),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
        assert!(store.get(&query_key!["todos", 1].hash_key()).expect("entry").is_stale);
        assert!(!store.get(&query_key!["users"].hash_key()).expect("entry").is_stale);
    }

    #[test]
    fn delete_closes_change_stream() {
        let key = query_key!["todos"];
        let (store, guard) = store_with(&key);
        let changes = store.change_stream(&key.hash_key()).expect("entry exists");

        assert!(store.delete(&key.hash_key()));
        assert!(changes.borrow().is_none());

        // Releasing the runner of a deleted entry is harmless.
        drop(guard);
        assert!(store.is_empty());
    }

    #[test]
    fn freshness_follows_stale_time_and_flag() {
        let now = Instant::now();
        let mut entry = CacheEntry::new(query_key!["a"]);
        assert!(!entry.is_fresh(Duration::from_secs(10), now));

        entry.cached_result = Some(Arc::new(1_u8));
        entry.last_fetched_at = Some(now);
        assert!(entry.is_fresh(Duration::from_secs(10), now));
        assert!(!entry.is_fresh(Duration::ZERO, now));

        entry.is_stale = true;
        assert!(!entry.is_fresh(Duration::from_secs(10), now));
    }

    #[tokio::test(start_paused = true)]
    async fn release_after_keeps_entry_for_grace_period() {
        let key = query_key!["todos"];
        let (store, guard) = store_with(&key);

        guard.release_after(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get(&key.hash_key()).is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get(&key.hash_key()).is_none());
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let key = query_key!["todos"];
        let (store, _guard) = store_with(&key);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .inner
                .records
                .lock()
                .expect("records lock should be acquired");
            panic!("poison records lock");
        }));

        assert!(store.update(&key.hash_key(), EntryPatch::new().stale(true)));
        assert!(store.get(&key.hash_key()).expect("entry").is_stale);
    }
}
