//! Cache layer: query keys, entry storage and client defaults.
//!
//! - **Keys**: structured [`QueryKey`]s with a canonical serialization used
//!   for hashing and exact equality, plus positional prefix matching.
//! - **Store**: reference-counted [`CacheEntry`] snapshots with per-entry and
//!   store-wide change notification.
//!
//! ## Configuration
//!
//! Defaults are loaded from the `[client]` table of `querycache.toml`:
//!
//! ```toml
//! [client]
//! stale_time_ms = 0
//! cache_time_ms = 300000
//! retry_count = 3
//! network_mode = "online"
//! # ... see config.rs for all options
//! ```

mod config;
mod keys;
pub(crate) mod lock;
mod store;

pub use config::ClientConfig;
pub use keys::{QueryKey, compare, serialize};
pub use store::{CacheEntry, CacheStore, EntryChanges, EntryPatch, RunnerGuard, StoreEvent};
