//! Per-fingerprint fetch sessions.
//!
//! Each fingerprint with subscribers owns at most one session. A session is a
//! tokio task that invokes the producer, folds the resulting events into the
//! shared live result, and then either sleeps until the next retry/refresh
//! tick or finishes. The next tick is only ever armed after the previous one
//! completed, so one producer call per fingerprint is in flight at a time.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::config::SwrConfig;
use crate::cache::keys::Fingerprint;
use crate::cache::lock::mutex_lock;
use crate::cache::registry::SubscriptionRegistry;
use crate::cache::store::CacheStore;

use super::producer::{Cleanup, Producer, ProducerEvent, normalize};
use super::result::{LiveResult, SharedResult};

const SOURCE: &str = "fetch::coordinator";
const METRIC_FETCH: &str = "swr_fetch_total";
const METRIC_DEDUP_HIT: &str = "swr_dedup_hit_total";
const METRIC_PRODUCER_ERROR: &str = "swr_producer_error_total";
const METRIC_RETRY_SCHEDULED: &str = "swr_retry_scheduled_total";
const METRIC_REFRESH_SCHEDULED: &str = "swr_refresh_scheduled_total";

/// Store type the coordinator writes live results into.
pub type ResultStore<D, E> = dyn CacheStore<SharedResult<D, E>>;

/// Where a fetch session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not fetching and nothing scheduled.
    Idle,
    /// A producer call is in flight.
    Fetching,
    /// The latest event was a success; waiting for the tick to complete.
    Succeeded,
    /// The latest event was a failure. Terminal once retries are exhausted.
    Failed,
    /// Sleeping until the next retry or refresh tick.
    Scheduled,
    /// Torn down by detach, key change or shutdown.
    Invalidated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Scheduled => "scheduled",
            Self::Invalidated => "invalidated",
        };
        f.write_str(label)
    }
}

/// State shared between a session handle and its driver task.
///
/// The state mutex also serialises invalidation against the driver's writes:
/// once `mark_invalidated` returns, no further write from the driver lands in
/// the record or the store.
struct SessionControl {
    invalidated: AtomicBool,
    state: Mutex<SessionState>,
    cleanup: Mutex<Option<Cleanup>>,
}

impl SessionControl {
    fn new() -> Self {
        Self {
            invalidated: AtomicBool::new(false),
            state: Mutex::new(SessionState::Idle),
            cleanup: Mutex::new(None),
        }
    }

    fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    fn state(&self) -> SessionState {
        *mutex_lock(&self.state, SOURCE, "session.state")
    }

    fn set_state(&self, next: SessionState) {
        self.while_live(|state| *state = next);
    }

    /// Run `apply` with the state locked, unless the session was invalidated.
    fn while_live<R>(&self, apply: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        let mut state = mutex_lock(&self.state, SOURCE, "session.while_live");
        if self.is_invalidated() {
            return None;
        }
        Some(apply(&mut state))
    }

    /// Install the cleanup of the latest streaming tick, running the one it
    /// replaces. If the session was invalidated meanwhile the new cleanup runs
    /// right away.
    fn replace_cleanup(&self, cleanup: Option<Cleanup>) {
        let previous = {
            let mut slot = mutex_lock(&self.cleanup, SOURCE, "session.replace_cleanup");
            std::mem::replace(&mut *slot, cleanup)
        };
        if let Some(previous) = previous {
            previous();
        }
        if self.is_invalidated() {
            if let Some(current) = self.take_cleanup() {
                current();
            }
        }
    }

    fn take_cleanup(&self) -> Option<Cleanup> {
        mutex_lock(&self.cleanup, SOURCE, "session.take_cleanup").take()
    }

    fn mark_invalidated(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "session.invalidate");
        self.invalidated.store(true, Ordering::SeqCst);
        *state = SessionState::Invalidated;
    }

    fn invalidate(&self) -> Option<Cleanup> {
        self.mark_invalidated();
        self.take_cleanup()
    }
}

struct Session {
    id: u64,
    control: Arc<SessionControl>,
    task: JoinHandle<()>,
}

impl Session {
    /// Whether the driver is still fetching or waiting for its next tick.
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the driver and hand back the pending cleanup, if any.
    fn cancel(self) -> Option<Cleanup> {
        let cleanup = self.control.invalidate();
        self.task.abort();
        debug!(session = self.id, "Fetch session cancelled");
        cleanup
    }
}

/// The record of a fingerprint with subscribers, and its session if one was
/// started.
///
/// A slot lives from the first attach to the last detach, independently of
/// the store entry, so an entry evicted while subscribers are attached never
/// separates them from later writes.
struct Slot<D, E> {
    result: SharedResult<D, E>,
    session: Option<Session>,
}

impl<D, E> Slot<D, E> {
    fn running(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_running)
    }
}

/// Everything a driver task needs, moved into the task.
struct Driver<D, E> {
    session: u64,
    fingerprint: Fingerprint,
    args: Vec<Value>,
    producer: Producer<D, E>,
    config: SwrConfig,
    result: SharedResult<D, E>,
    store: Arc<ResultStore<D, E>>,
    control: Arc<SessionControl>,
}

impl<D, E> Driver<D, E>
where
    D: Clone + Send + Sync + 'static,
    E: Clone + fmt::Display + Send + Sync + 'static,
{
    async fn run(self) {
        let mut failures: Option<u32> = None;

        loop {
            let started = self.control.while_live(|state| {
                *state = SessionState::Fetching;
                self.result.update(|result| result.is_validating = true);
            });
            if started.is_none() {
                return;
            }
            counter!(METRIC_FETCH).increment(1);
            debug!(
                session = self.session,
                fingerprint = %self.fingerprint,
                producer = self.producer.name(),
                "Invoking producer"
            );

            let tick = normalize(self.producer.invoke(&self.args));
            self.control.replace_cleanup(tick.cleanup);
            let mut events = tick.events;

            while let Some(event) = events.next().await {
                let applied = match event {
                    ProducerEvent::Next(data) => {
                        failures = None;
                        self.on_next(data)
                    }
                    ProducerEvent::Error(error) => {
                        let attempt = failures.map_or(0, |count| count + 1);
                        failures = Some(attempt);
                        self.on_error(error, attempt)
                    }
                    ProducerEvent::Complete => break,
                };
                if !applied {
                    return;
                }
            }

            if self.control.is_invalidated() {
                return;
            }

            match self.config.next_tick_delay(failures) {
                Some(delay) => self.schedule(delay, failures).await,
                None => {
                    let state = if failures.is_some() {
                        SessionState::Failed
                    } else {
                        SessionState::Idle
                    };
                    self.control.set_state(state);
                    debug!(
                        session = self.session,
                        fingerprint = %self.fingerprint,
                        state = %state,
                        "Fetch session idle"
                    );
                    return;
                }
            }
        }
    }

    /// Returns `false` when the session was invalidated and nothing was
    /// written.
    fn on_next(&self, data: D) -> bool {
        self.control
            .while_live(|state| {
                self.result.update(|result| {
                    result.data = Some(data);
                    result.error = None;
                    result.is_validating = false;
                });
                // Re-set to push the entry's expiry out.
                self.store
                    .set(self.fingerprint.as_str(), self.result.clone(), self.config.ttl);
                *state = SessionState::Succeeded;
            })
            .is_some()
    }

    fn on_error(&self, error: E, attempt: u32) -> bool {
        warn!(
            session = self.session,
            fingerprint = %self.fingerprint,
            attempt,
            error = %error,
            "Producer failed"
        );
        counter!(METRIC_PRODUCER_ERROR).increment(1);
        self.control
            .while_live(|state| {
                self.result.update(|result| {
                    result.error = Some(error);
                    result.is_validating = false;
                });
                *state = SessionState::Failed;
            })
            .is_some()
    }

    async fn schedule(&self, delay: Duration, failures: Option<u32>) {
        self.control.set_state(SessionState::Scheduled);
        match failures {
            Some(attempt) => {
                counter!(METRIC_RETRY_SCHEDULED).increment(1);
                debug!(
                    session = self.session,
                    fingerprint = %self.fingerprint,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retry scheduled"
                );
            }
            None => {
                counter!(METRIC_REFRESH_SCHEDULED).increment(1);
                debug!(
                    session = self.session,
                    fingerprint = %self.fingerprint,
                    delay_ms = delay.as_millis() as u64,
                    "Refresh scheduled"
                );
            }
        }
        tokio::time::sleep(delay).await;
    }
}

/// Owns the fetch sessions and the bookkeeping around attach/detach.
///
/// Lock order is slots → registry → session state → store; the driver tasks
/// only take the session state and the store.
pub struct FetchCoordinator<D, E> {
    store: Arc<ResultStore<D, E>>,
    registry: SubscriptionRegistry,
    slots: Mutex<HashMap<Fingerprint, Slot<D, E>>>,
    next_session: AtomicU64,
}

impl<D, E> FetchCoordinator<D, E>
where
    D: Clone + Send + Sync + 'static,
    E: Clone + fmt::Display + Send + Sync + 'static,
{
    pub fn new(store: Arc<ResultStore<D, E>>) -> Self {
        Self {
            store,
            registry: SubscriptionRegistry::new(),
            slots: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<ResultStore<D, E>> {
        &self.store
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Fingerprint of `args` for the producer called `scope`, as serialized
    /// by the store.
    pub fn fingerprint(&self, scope: &str, args: &[Value]) -> Fingerprint {
        Fingerprint::with(scope, args, |key| self.store.serialize_key(key))
    }

    /// Attach a subscriber to `fingerprint` and return the live result it
    /// should observe.
    ///
    /// A running session is joined as is. A cached entry younger than the
    /// deduping interval is joined without a producer call. Otherwise a new
    /// session starts, reusing any existing record so stale data stays
    /// visible while it revalidates.
    pub fn attach(
        &self,
        fingerprint: &Fingerprint,
        args: Vec<Value>,
        producer: &Producer<D, E>,
        config: &SwrConfig,
    ) -> SharedResult<D, E> {
        let (result, retired) = {
            let mut slots = mutex_lock(&self.slots, SOURCE, "attach");
            let subscribers = self.registry.attach(fingerprint.as_str());
            let cached = self.store.get(fingerprint.as_str());
            let slot = slots.entry(fingerprint.clone()).or_insert_with(|| Slot {
                result: cached.as_ref().map_or_else(
                    || SharedResult::new(LiveResult::pending()),
                    |entry| entry.value.clone(),
                ),
                session: None,
            });

            if slot.running() {
                if cached.is_none() {
                    self.store
                        .set(fingerprint.as_str(), slot.result.clone(), config.ttl);
                }
                counter!(METRIC_DEDUP_HIT).increment(1);
                debug!(
                    fingerprint = %fingerprint,
                    subscribers,
                    "Joined running fetch session"
                );
                return slot.result.clone();
            }

            match &cached {
                Some(entry) if config.is_fresh(entry.age()) => {
                    counter!(METRIC_DEDUP_HIT).increment(1);
                    debug!(
                        fingerprint = %fingerprint,
                        subscribers,
                        age_ms = entry.age().as_millis() as u64,
                        "Joined fresh cache entry"
                    );
                    return slot.result.clone();
                }
                Some(_) => {}
                None => self
                    .store
                    .set(fingerprint.as_str(), slot.result.clone(), config.ttl),
            }

            let result = slot.result.clone();
            let session = self.start_session(fingerprint, args, producer, config, &result);
            info!(
                fingerprint = %fingerprint,
                session = session.id,
                subscribers,
                "Started fetch session"
            );
            (result, slot.session.replace(session))
        };

        if let Some(cleanup) = retired.and_then(Session::cancel) {
            cleanup();
        }
        result
    }

    /// Write an out-of-band value or error into the record for `fingerprint`.
    ///
    /// The producer is not involved. The record is created when missing and
    /// the entry is re-set with `ttl`.
    pub fn apply(&self, fingerprint: &Fingerprint, outcome: Result<D, E>, ttl: Duration) {
        let slots = mutex_lock(&self.slots, SOURCE, "apply");
        let result = self
            .lookup(&slots, fingerprint)
            .unwrap_or_else(|| SharedResult::new(LiveResult::idle()));

        match outcome {
            Ok(data) => result.update(|result| {
                result.data = Some(data);
                result.error = None;
            }),
            Err(error) => result.update(|result| result.error = Some(error)),
        }
        self.store.set(fingerprint.as_str(), result, ttl);
    }

    /// Live record for `fingerprint`, from its subscribers or the store.
    pub fn result(&self, fingerprint: &Fingerprint) -> Option<SharedResult<D, E>> {
        let slots = mutex_lock(&self.slots, SOURCE, "result");
        self.lookup(&slots, fingerprint)
    }

    pub fn session_state(&self, fingerprint: &Fingerprint) -> Option<SessionState> {
        mutex_lock(&self.slots, SOURCE, "session_state")
            .get(fingerprint)
            .and_then(|slot| slot.session.as_ref())
            .map(|session| session.control.state())
    }

    /// Cancel every session and forget every subscriber.
    pub fn shutdown(&self) {
        let retired: Vec<(Fingerprint, Slot<D, E>)> = {
            let mut slots = mutex_lock(&self.slots, SOURCE, "shutdown");
            self.registry.clear();
            slots.drain().collect()
        };

        let mut count = 0;
        for (fingerprint, slot) in retired {
            self.store.delete(fingerprint.as_str());
            if let Some(session) = slot.session {
                count += 1;
                if let Some(cleanup) = session.cancel() {
                    cleanup();
                }
            }
        }
        self.store.clear();
        info!(sessions = count, "Fetch coordinator shut down");
    }

    fn start_session(
        &self,
        fingerprint: &Fingerprint,
        args: Vec<Value>,
        producer: &Producer<D, E>,
        config: &SwrConfig,
        result: &SharedResult<D, E>,
    ) -> Session {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let control = Arc::new(SessionControl::new());
        result.update(|result| result.is_validating = true);

        let driver = Driver {
            session: id,
            fingerprint: fingerprint.clone(),
            args,
            producer: producer.clone(),
            config: config.clone(),
            result: result.clone(),
            store: Arc::clone(&self.store),
            control: Arc::clone(&control),
        };

        Session {
            id,
            control,
            task: tokio::spawn(driver.run()),
        }
    }
}

impl<D, E> FetchCoordinator<D, E> {
    fn lookup(
        &self,
        slots: &HashMap<Fingerprint, Slot<D, E>>,
        fingerprint: &Fingerprint,
    ) -> Option<SharedResult<D, E>> {
        slots
            .get(fingerprint)
            .map(|slot| slot.result.clone())
            .or_else(|| {
                self.store
                    .get(fingerprint.as_str())
                    .map(|entry| entry.value)
            })
    }

    /// Detach one subscriber from `fingerprint`; returns how many remain.
    ///
    /// When the last one leaves, the session is cancelled and the entry is
    /// re-armed with the invalidated-cache TTL so a quick resubscribe finds it.
    pub fn detach(&self, fingerprint: &Fingerprint, config: &SwrConfig) -> usize {
        let retired = {
            let mut slots = mutex_lock(&self.slots, SOURCE, "detach");
            let remaining = self.registry.detach(fingerprint.as_str());
            if remaining > 0 {
                return remaining;
            }

            let slot = slots.remove(fingerprint);
            let (result, session) = match slot {
                Some(Slot { result, session }) => (Some(result), session),
                None => (
                    self.store
                        .get(fingerprint.as_str())
                        .map(|entry| entry.value),
                    None,
                ),
            };

            let was_running = session.as_ref().is_some_and(Session::is_running);
            if let Some(session) = &session {
                session.control.mark_invalidated();
            }
            if let Some(result) = result {
                if was_running {
                    result.update(|result| result.is_validating = false);
                }
                self.store.set(
                    fingerprint.as_str(),
                    result,
                    config.invalidated_cache_ttl,
                );
            }
            debug!(
                fingerprint = %fingerprint,
                grace_ms = config.invalidated_cache_ttl.as_millis() as u64,
                "Last subscriber detached"
            );
            session
        };

        if let Some(cleanup) = retired.and_then(Session::cancel) {
            cleanup();
        }
        0
    }
}

impl<D, E> Drop for FetchCoordinator<D, E> {
    fn drop(&mut self) {
        let slots = mutex_lock(&self.slots, SOURCE, "drop");
        for session in slots.values().filter_map(|slot| slot.session.as_ref()) {
            session.control.mark_invalidated();
            session.task.abort();
        }
    }
}
