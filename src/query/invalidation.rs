//! Invalidation coordinator.

use std::fmt;
use std::sync::Arc;

use metrics::counter;
use tracing::info;

use super::pipeline::{PipelineRegistry, live};
use super::trigger::Trigger;
use crate::cache::{CacheStore, EntryPatch, QueryKey, compare};

const METRIC_INVALIDATED_TOTAL: &str = "querycache_invalidated_total";

/// Caller-supplied key filter.
pub type KeyPredicate = Arc<dyn Fn(&QueryKey) -> bool + Send + Sync>;

/// Selects the entries an invalidation applies to.
///
/// With neither a key nor a predicate every entry matches. With both, an
/// entry must satisfy each of them.
#[derive(Clone, Default)]
pub struct InvalidateFilters {
    pub query_key: Option<QueryKey>,
    pub exact: bool,
    pub predicate: Option<KeyPredicate>,
}

impl fmt::Debug for InvalidateFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidateFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .finish()
    }
}

impl InvalidateFilters {
    /// Match every entry.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match entries whose key starts with `key`.
    pub fn key(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Match exactly `key`.
    pub fn exact(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            exact: true,
            predicate: None,
        }
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&QueryKey) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        let key_matches = self
            .query_key
            .as_ref()
            .is_none_or(|wanted| compare(wanted, key, self.exact));
        key_matches && self.predicate.as_ref().is_none_or(|predicate| predicate(key))
    }
}

/// Outcome of one invalidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Entries flagged stale.
    pub marked_stale: usize,
    /// Live pipelines asked to refetch.
    pub triggered: usize,
}

/// Flag every matching entry stale in one store pass, then ask each live
/// pipeline among them to refetch regardless of freshness.
pub(crate) fn invalidate<T>(
    store: &CacheStore<T>,
    pipelines: &PipelineRegistry<T>,
    filters: &InvalidateFilters,
) -> InvalidationReport {
    let keys = store.update_many(EntryPatch::new().stale(true), |entry| filters.matches(&entry.key));

    let mut triggered = 0;
    for hash in &keys {
        if let Some(pipeline) = live(pipelines, hash) {
            if pipeline.trigger(Trigger::invalidated(pipeline.key.clone())) {
                triggered += 1;
            }
        }
    }

    let report = InvalidationReport {
        marked_stale: keys.len(),
        triggered,
    };
    counter!(METRIC_INVALIDATED_TOTAL).increment(report.marked_stale as u64);
    info!(
        query_key = ?filters.query_key.as_ref().map(ToString::to_string),
        exact = filters.exact,
        marked_stale = report.marked_stale,
        triggered = report.triggered,
        "Queries invalidated"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;

    #[test]
    fn empty_filters_match_everything() {
        assert!(InvalidateFilters::all().matches(&query_key!["anything", 1]));
    }

    #[test]
    fn key_filter_matches_by_prefix() {
        let filters = InvalidateFilters::key(["todos"]);
        assert!(filters.matches(&query_key!["todos", 1]));
        assert!(!filters.matches(&query_key!["users"]));
    }

    #[test]
    fn exact_filter_matches_only_identical_keys() {
        let filters = InvalidateFilters::exact(["todos"]);
        assert!(filters.matches(&query_key!["todos"]));
        assert!(!filters.matches(&query_key!["todos", 1]));
    }

    #[test]
    fn key_and_predicate_must_both_match() {
        let filters = InvalidateFilters::key(["todos"])
            .with_predicate(|key| key.parts().get(1).and_then(|part| part.as_u64()) == Some(2));
        assert!(filters.matches(&query_key!["todos", 2]));
        assert!(!filters.matches(&query_key!["todos", 1]));
        assert!(!filters.matches(&query_key!["users", 2]));
    }

    #[test]
    fn invalidate_marks_matching_entries_without_pipelines() {
        let store: CacheStore<u32> = CacheStore::new();
        let registry: PipelineRegistry<u32> = PipelineRegistry::new();
        let _todos = store.add_runner(&query_key!["todos", 1]);
        let _users = store.add_runner(&query_key!["users"]);

        let report = invalidate(&store, &registry, &InvalidateFilters::key(["todos"]));

        assert_eq!(report, InvalidationReport { marked_stale: 1, triggered: 0 });
        assert!(store.get(&query_key!["todos", 1].hash_key()).expect("entry").is_stale);
        assert!(!store.get(&query_key!["users"].hash_key()).expect("entry").is_stale);
    }
}
