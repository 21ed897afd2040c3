//! Request identity, storage and subscriber bookkeeping.
//!
//! Entries are keyed by a [`Fingerprint`] derived from the resolved key
//! arguments and live in a [`CacheStore`]. Stores expire entries on their own
//! timers; the [`SubscriptionRegistry`] tells the engine when the last
//! observer of a fingerprint has gone.
//!
//! ## Configuration
//!
//! Revalidation is tuned through the `[swr]` table of `swr.toml`:
//!
//! ```toml
//! [swr]
//! refresh_interval_ms = 0
//! invalidated_cache_ttl_ms = 5000
//! error_retry_count = 5
//! # ... see config.rs for all options
//! ```

pub mod config;
pub mod keys;
pub(crate) mod lock;
pub mod registry;
pub mod store;

pub use config::{RawSwrConfig, SwrConfig};
pub use keys::{Fingerprint, Key, hash_values, serialize};
pub use registry::SubscriptionRegistry;
pub use store::{CacheEntry, CacheStore, MemoryStore};
