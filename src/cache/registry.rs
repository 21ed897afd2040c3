//! Subscriber reference counts.
//!
//! Tracks how many live subscriptions point at each fingerprint so the
//! engine knows when the last one goes away and the entry should move to its
//! grace period.

use std::collections::HashMap;
use std::sync::Mutex;

use metrics::gauge;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::registry";
const METRIC_SUBSCRIBERS: &str = "swr_subscribers";

/// Maps fingerprints to their number of attached subscribers.
pub struct SubscriptionRegistry {
    counts: Mutex<HashMap<String, usize>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Register one more subscriber and return the new count.
    pub fn attach(&self, fingerprint: &str) -> usize {
        let mut counts = mutex_lock(&self.counts, SOURCE, "attach");
        let count = counts.entry(fingerprint.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        gauge!(METRIC_SUBSCRIBERS).set(counts.values().sum::<usize>() as f64);
        count
    }

    /// Drop one subscriber and return the remaining count.
    ///
    /// At zero the fingerprint is forgotten. Detaching an unknown fingerprint
    /// is a no-op that reports zero.
    pub fn detach(&self, fingerprint: &str) -> usize {
        let mut counts = mutex_lock(&self.counts, SOURCE, "detach");
        let remaining = match counts.get_mut(fingerprint) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                counts.remove(fingerprint);
                0
            }
            None => 0,
        };
        gauge!(METRIC_SUBSCRIBERS).set(counts.values().sum::<usize>() as f64);
        remaining
    }

    pub fn count(&self, fingerprint: &str) -> usize {
        mutex_lock(&self.counts, SOURCE, "count")
            .get(fingerprint)
            .copied()
            .unwrap_or(0)
    }

    /// Number of fingerprints with at least one subscriber.
    pub fn len(&self) -> usize {
        mutex_lock(&self.counts, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.counts, SOURCE, "clear").clear();
        gauge!(METRIC_SUBSCRIBERS).set(0.0);
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
