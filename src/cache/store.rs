//! TTL-keyed cache storage.
//!
//! Entries expire actively. Each key with a deadline has at most one timer:
//! a later `set` that pushes the deadline out leaves the timer alone, and the
//! timer re-reads the entry when it fires and sleeps again until the current
//! deadline. Only a `set` that pulls the deadline in arms a new timer, which
//! retires the old one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use metrics::counter;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::keys::{self, Key};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";
const METRIC_CACHE_EXPIRED: &str = "swr_cache_expired_total";

/// A stored value together with its lifetime stamps.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub fingerprint: String,
    pub value: V,
    pub created_at: Instant,
    /// `None` means the entry never expires.
    pub expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.created_at)
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Pluggable cache backend.
///
/// `ttl` of zero means "use the store's default"; a store whose default is
/// also zero keeps the entry forever.
pub trait CacheStore<V>: Send + Sync {
    fn get(&self, fingerprint: &str) -> Option<CacheEntry<V>>;

    /// Insert or overwrite an entry, restamping `created_at`/`expires_at`.
    fn set(&self, fingerprint: &str, value: V, ttl: Duration);

    fn delete(&self, fingerprint: &str);

    /// Drop every entry. Stores that cannot enumerate their entries may leave
    /// this as a no-op.
    fn clear(&self) {}

    /// Serialize a request identity into the string this store keys on.
    fn serialize_key(&self, key: &Key) -> String {
        keys::serialize(key)
    }
}

/// In-process store backed by a hash map.
pub struct MemoryStore<V> {
    inner: Arc<StoreInner<V>>,
}

struct StoreInner<V> {
    default_ttl: Duration,
    state: Mutex<StoreState<V>>,
}

struct StoreState<V> {
    items: HashMap<String, CacheEntry<V>>,
    /// Armed expiry timer per key: its generation and the deadline it sleeps
    /// towards.
    timers: HashMap<String, (u64, Instant)>,
    next_timer: u64,
}

impl<V> StoreInner<V> {
    /// Called by the timer `generation` of `fingerprint` when it wakes.
    /// Returns the deadline to sleep towards next, or `None` when the timer
    /// is done.
    fn on_timer(&self, fingerprint: &str, generation: u64) -> Option<Instant> {
        let mut state = mutex_lock(&self.state, SOURCE, "on_timer");
        if state.timers.get(fingerprint).map(|(armed, _)| *armed) != Some(generation) {
            return None;
        }

        let now = Instant::now();
        let expires_at = state.items.get(fingerprint).and_then(|entry| entry.expires_at);
        match expires_at {
            Some(deadline) if deadline > now => {
                state
                    .timers
                    .insert(fingerprint.to_string(), (generation, deadline));
                Some(deadline)
            }
            Some(_) => {
                state.items.remove(fingerprint);
                state.timers.remove(fingerprint);
                counter!(METRIC_CACHE_EXPIRED).increment(1);
                debug!(fingerprint, "Cache entry expired");
                None
            }
            None => {
                state.timers.remove(fingerprint);
                None
            }
        }
    }
}

impl<V> MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a store whose entries fall back to `default_ttl`.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                default_ttl,
                state: Mutex::new(StoreState {
                    items: HashMap::new(),
                    timers: HashMap::new(),
                    next_timer: 0,
                }),
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "len").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with an expiry timer armed.
    pub fn armed_timers(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "armed_timers")
            .timers
            .len()
    }

    /// Make sure a timer wakes for `fingerprint` no later than `deadline`.
    fn arm_expiry(&self, state: &mut StoreState<V>, fingerprint: &str, deadline: Instant) {
        if state
            .timers
            .get(fingerprint)
            .is_some_and(|(_, armed)| *armed <= deadline)
        {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            warn!(fingerprint, "No tokio runtime; cache entry will not expire actively");
            return;
        };

        let generation = state.next_timer;
        state.next_timer += 1;
        state
            .timers
            .insert(fingerprint.to_string(), (generation, deadline));

        let inner: Weak<StoreInner<V>> = Arc::downgrade(&self.inner);
        let fingerprint = fingerprint.to_string();
        handle.spawn(async move {
            let mut deadline = deadline;
            loop {
                tokio::time::sleep_until(deadline).await;
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match inner.on_timer(&fingerprint, generation) {
                    Some(next) => deadline = next,
                    None => return,
                }
            }
        });
    }
}

impl<V> Default for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl<V> Clone for MemoryStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CacheStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, fingerprint: &str) -> Option<CacheEntry<V>> {
        mutex_lock(&self.inner.state, SOURCE, "get")
            .items
            .get(fingerprint)
            .cloned()
    }

    fn set(&self, fingerprint: &str, value: V, ttl: Duration) {
        let ttl = if ttl.is_zero() {
            self.inner.default_ttl
        } else {
            ttl
        };
        let now = Instant::now();
        let expires_at = if ttl.is_zero() {
            None
        } else {
            now.checked_add(ttl)
        };

        let mut state = mutex_lock(&self.inner.state, SOURCE, "set");
        state.items.insert(
            fingerprint.to_string(),
            CacheEntry {
                fingerprint: fingerprint.to_string(),
                value,
                created_at: now,
                expires_at,
            },
        );
        if let Some(deadline) = expires_at {
            self.arm_expiry(&mut state, fingerprint, deadline);
        }
    }

    fn delete(&self, fingerprint: &str) {
        mutex_lock(&self.inner.state, SOURCE, "delete")
            .items
            .remove(fingerprint);
    }

    fn clear(&self) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "clear");
        state.items.clear();
        state.timers.clear();
    }
}
