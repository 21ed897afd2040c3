//! Revalidation options.
//!
//! Every subscription runs with a [`SwrConfig`]. Contexts carry a default one,
//! usually built from the `[swr]` table of the settings file.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_REFRESH_INTERVAL_MS: u64 = 0;
const DEFAULT_INVALIDATED_CACHE_TTL_MS: u64 = 5000;
const DEFAULT_TTL_MS: u64 = 0;
const DEFAULT_ERROR_RETRY_INTERVAL_MS: u64 = 5000;
const DEFAULT_ERROR_RETRY_COUNT: u32 = 5;

/// Options governing fetching, deduplication, retry and entry lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwrConfig {
    /// Delay between successful fetches. Zero disables periodic refresh.
    pub refresh_interval: Duration,
    /// Window during which a fresh entry satisfies new subscribers without a
    /// producer call. `Duration::MAX` never refetches for new subscribers.
    pub deduping_interval: Duration,
    /// Grace period an entry is kept after its last subscriber detaches.
    pub invalidated_cache_ttl: Duration,
    /// Entry lifetime, refreshed on every success. Zero defers to the store.
    pub ttl: Duration,
    pub should_retry_on_error: bool,
    /// Delay before retrying a failed fetch. Zero disables retries.
    pub error_retry_interval: Duration,
    /// Maximum number of retries after consecutive failures.
    pub error_retry_count: u32,
}

impl Default for SwrConfig {
    fn default() -> Self {
        Self::from_raw(RawSwrConfig::default())
    }
}

impl SwrConfig {
    pub fn from_raw(raw: RawSwrConfig) -> Self {
        Self {
            refresh_interval: Duration::from_millis(raw.refresh_interval_ms),
            deduping_interval: raw
                .deduping_interval_ms
                .map_or(Duration::MAX, Duration::from_millis),
            invalidated_cache_ttl: Duration::from_millis(raw.invalidated_cache_ttl_ms),
            ttl: Duration::from_millis(raw.ttl_ms),
            should_retry_on_error: raw.should_retry_on_error,
            error_retry_interval: Duration::from_millis(raw.error_retry_interval_ms),
            error_retry_count: raw.error_retry_count,
        }
    }

    /// Whether an entry of the given age still satisfies new subscribers.
    pub fn is_fresh(&self, age: Duration) -> bool {
        age < self.deduping_interval
    }

    /// Delay before the next fetch once a tick completes.
    ///
    /// `failures` is `None` when the last event was a success, otherwise the
    /// zero-based count of consecutive failures. Returns `None` when the
    /// session should go idle.
    pub fn next_tick_delay(&self, failures: Option<u32>) -> Option<Duration> {
        match failures {
            Some(attempt) => (self.should_retry_on_error
                && attempt < self.error_retry_count
                && !self.error_retry_interval.is_zero())
            .then_some(self.error_retry_interval),
            None => (!self.refresh_interval.is_zero()).then_some(self.refresh_interval),
        }
    }
}

/// Millisecond-based form of [`SwrConfig`] as found in settings files.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawSwrConfig {
    pub refresh_interval_ms: u64,
    /// Absent means "deduplicate forever".
    pub deduping_interval_ms: Option<u64>,
    pub invalidated_cache_ttl_ms: u64,
    pub ttl_ms: u64,
    pub should_retry_on_error: bool,
    pub error_retry_interval_ms: u64,
    pub error_retry_count: u32,
}

impl Default for RawSwrConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            deduping_interval_ms: None,
            invalidated_cache_ttl_ms: DEFAULT_INVALIDATED_CACHE_TTL_MS,
            ttl_ms: DEFAULT_TTL_MS,
            should_retry_on_error: true,
            error_retry_interval_ms: DEFAULT_ERROR_RETRY_INTERVAL_MS,
            error_retry_count: DEFAULT_ERROR_RETRY_COUNT,
        }
    }
}

impl From<RawSwrConfig> for SwrConfig {
    fn from(raw: RawSwrConfig) -> Self {
        Self::from_raw(raw)
    }
}
