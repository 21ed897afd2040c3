//! The engine's explicit context object.
//!
//! A [`SwrContext`] bundles the cache store, the subscriber registry, the fetch
//! coordinator and the default [`SwrConfig`]. Independent contexts never share
//! entries, which keeps tests isolated. Contexts are cheap to clone.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use metrics::counter;
use tracing::{debug, instrument};

use crate::cache::config::SwrConfig;
use crate::cache::keys::{Fingerprint, Key};
use crate::cache::store::MemoryStore;
use crate::fetch::{FetchCoordinator, Producer, ResultStore, SessionState, SharedResult};
use crate::infra::error::ProducerError;
use crate::subscription::Subscription;

const METRIC_MUTATE: &str = "swr_mutate_total";

/// Value written by [`SwrContext::mutate`].
pub enum Mutation<D, E> {
    /// Write this value.
    Value(D),
    /// Write this error, keeping the previous data.
    Error(E),
    /// Await this first; its outcome is written.
    Deferred(BoxFuture<'static, Result<D, E>>),
}

impl<D, E> Mutation<D, E> {
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<D, E>> + Send + 'static,
    {
        Self::Deferred(Box::pin(future))
    }

    async fn resolve(self) -> Result<D, E> {
        match self {
            Self::Value(data) => Ok(data),
            Self::Error(error) => Err(error),
            Self::Deferred(future) => future.await,
        }
    }
}

impl<D, E> From<D> for Mutation<D, E> {
    fn from(data: D) -> Self {
        Self::Value(data)
    }
}

impl<D, E> fmt::Debug for Mutation<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            Self::Value(_) => "Value",
            Self::Error(_) => "Error",
            Self::Deferred(_) => "Deferred",
        };
        f.debug_tuple("Mutation").field(&shape).finish()
    }
}

/// Where and for how long a mutation is written.
#[derive(Debug, Clone, Default)]
pub struct MutateOptions {
    /// Producer name the target entry is scoped to. Empty addresses entries of
    /// unnamed producers.
    pub scope: String,
    /// Entry lifetime; `None` uses the context default.
    pub ttl: Option<Duration>,
}

impl MutateOptions {
    pub fn scoped(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

struct ContextInner<D, E> {
    config: SwrConfig,
    coordinator: FetchCoordinator<D, E>,
}

/// Store, registry, coordinator and defaults of one engine instance.
///
/// Subscribing spawns tokio tasks, so it must happen inside a tokio runtime.
pub struct SwrContext<D, E = ProducerError> {
    inner: Arc<ContextInner<D, E>>,
}

impl<D, E> Clone for SwrContext<D, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D, E> fmt::Debug for SwrContext<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwrContext")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<D, E> Default for SwrContext<D, E>
where
    D: Clone + Send + Sync + 'static,
    E: Clone + fmt::Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(SwrConfig::default())
    }
}

impl<D, E> SwrContext<D, E>
where
    D: Clone + Send + Sync + 'static,
    E: Clone + fmt::Display + Send + Sync + 'static,
{
    /// Context backed by an in-memory store without a default TTL.
    pub fn new(config: SwrConfig) -> Self {
        Self::with_store(
            config,
            Arc::new(MemoryStore::<SharedResult<D, E>>::new(Duration::ZERO)),
        )
    }

    /// Context backed by a caller-supplied store.
    pub fn with_store(config: SwrConfig, store: Arc<ResultStore<D, E>>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config,
                coordinator: FetchCoordinator::new(store),
            }),
        }
    }

    /// Defaults applied by [`SwrContext::subscribe`] and [`SwrContext::mutate`].
    pub fn config(&self) -> &SwrConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<ResultStore<D, E>> {
        self.inner.coordinator.store()
    }

    /// Subscribe to `key` with the context defaults.
    pub fn subscribe(&self, key: impl Into<Key>, producer: Producer<D, E>) -> Subscription<D, E> {
        self.subscribe_with(key, producer, self.inner.config.clone())
    }

    /// Subscribe to `key`, fetching through `producer` under `config`.
    ///
    /// Returns immediately. The subscription observes the shared record for
    /// the key's fingerprint; the producer is only called when no session is
    /// running and no fresh entry exists.
    pub fn subscribe_with(
        &self,
        key: impl Into<Key>,
        producer: Producer<D, E>,
        config: SwrConfig,
    ) -> Subscription<D, E> {
        Subscription::open(self.clone(), key.into(), producer, config)
    }

    /// Write a value or error into the entry for `key`, outside any producer.
    ///
    /// A deferred value is awaited first. Keys that resolve to nothing are
    /// ignored. Fetching is not restarted.
    pub async fn mutate(&self, key: impl Into<Key>, value: impl Into<Mutation<D, E>>) {
        self.mutate_with(key, value, MutateOptions::default()).await;
    }

    /// [`SwrContext::mutate`] aimed at the entries of the producer named
    /// `scope`.
    pub async fn mutate_scoped(
        &self,
        scope: &str,
        key: impl Into<Key>,
        value: impl Into<Mutation<D, E>>,
    ) {
        self.mutate_with(key, value, MutateOptions::scoped(scope))
            .await;
    }

    /// Write an error into the entry for `key`, keeping its data.
    pub async fn mutate_error(&self, key: impl Into<Key>, error: E) {
        self.mutate_with(key, Mutation::Error(error), MutateOptions::default())
            .await;
    }

    pub async fn mutate_with(
        &self,
        key: impl Into<Key>,
        value: impl Into<Mutation<D, E>>,
        options: MutateOptions,
    ) {
        let key = key.into();
        let Some(args) = key.resolve_args() else {
            debug!(key = ?key, "Mutation skipped; key not ready");
            return;
        };
        let fingerprint = self.inner.coordinator.fingerprint(&options.scope, &args);
        self.write(fingerprint, value.into(), options.ttl).await;
    }

    #[instrument(skip(self, fingerprint, value), fields(fingerprint = %fingerprint))]
    pub(crate) async fn write(
        &self,
        fingerprint: Fingerprint,
        value: Mutation<D, E>,
        ttl: Option<Duration>,
    ) {
        let outcome = value.resolve().await;
        let ok = outcome.is_ok();
        let ttl = ttl.unwrap_or(self.inner.config.ttl);
        self.inner.coordinator.apply(&fingerprint, outcome, ttl);
        counter!(METRIC_MUTATE).increment(1);
        debug!(ok, ttl_ms = ttl.as_millis() as u64, "Mutation applied");
    }

    /// Number of live subscriptions observing `fingerprint`.
    pub fn subscriber_count(&self, fingerprint: &Fingerprint) -> usize {
        self.inner
            .coordinator
            .registry()
            .count(fingerprint.as_str())
    }

    /// State of the fetch session for `fingerprint`, if one exists.
    pub fn session_state(&self, fingerprint: &Fingerprint) -> Option<SessionState> {
        self.inner.coordinator.session_state(fingerprint)
    }

    /// Current record for `fingerprint`, from a live session or the store.
    pub fn result(&self, fingerprint: &Fingerprint) -> Option<SharedResult<D, E>> {
        self.inner.coordinator.result(fingerprint)
    }

    /// Cancel every session, run pending stream cleanups and clear the store.
    ///
    /// Subscriptions that are still alive keep their last snapshot but receive
    /// no further updates.
    pub fn shutdown(&self) {
        self.inner.coordinator.shutdown();
    }
}

impl<D, E> SwrContext<D, E> {
    pub(crate) fn coordinator(&self) -> &FetchCoordinator<D, E> {
        &self.inner.coordinator
    }
}
