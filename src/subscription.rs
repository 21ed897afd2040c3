use std::fmt;

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::cache::config::SwrConfig;
use crate::cache::keys::{Fingerprint, Key};
use crate::context::{Mutation, SwrContext};
use crate::fetch::{LiveResult, Producer, SharedResult};
use crate::infra::error::ProducerError;

/// Live handle on the shared result of one key.
///
/// Every subscription to the same fingerprint observes the same record.
/// Dropping the handle detaches it; when the last one goes the fetch session
/// stops and the entry enters its grace period.
pub struct Subscription<D, E = ProducerError> {
    context: SwrContext<D, E>,
    producer: Producer<D, E>,
    config: SwrConfig,
    key: Vec<Value>,
    fingerprint: Option<Fingerprint>,
    receiver: watch::Receiver<LiveResult<D, E>>,
}

struct Attached<D, E> {
    key: Vec<Value>,
    fingerprint: Option<Fingerprint>,
    receiver: watch::Receiver<LiveResult<D, E>>,
}

impl<D, E> Subscription<D, E>
where
    D: Clone + Send + Sync + 'static,
    E: Clone + fmt::Display + Send + Sync + 'static,
{
    pub(crate) fn open(
        context: SwrContext<D, E>,
        key: Key,
        producer: Producer<D, E>,
        config: SwrConfig,
    ) -> Self {
        let attached = attach(&context, &key, &producer, &config);
        Self {
            context,
            producer,
            config,
            key: attached.key,
            fingerprint: attached.fingerprint,
            receiver: attached.receiver,
        }
    }

    /// Point the subscription at a different key.
    ///
    /// The new key is attached before the old one is released, so switching
    /// to the same fingerprint keeps the running session.
    pub fn set_key(&mut self, key: impl Into<Key>) {
        let attached = attach(&self.context, &key.into(), &self.producer, &self.config);
        self.release();
        self.key = attached.key;
        self.fingerprint = attached.fingerprint;
        self.receiver = attached.receiver;
    }

    /// Write a value or error into this subscription's entry.
    ///
    /// Idle subscriptions ignore the call.
    pub async fn mutate(&self, value: impl Into<Mutation<D, E>>) {
        if let Some(fingerprint) = &self.fingerprint {
            self.context
                .write(fingerprint.clone(), value.into(), Some(self.config.ttl))
                .await;
        }
    }

    pub fn snapshot(&self) -> LiveResult<D, E> {
        self.receiver.borrow().clone()
    }

    pub fn data(&self) -> Option<D> {
        self.receiver.borrow().data.clone()
    }

    pub fn error(&self) -> Option<E> {
        self.receiver.borrow().error.clone()
    }

    /// Wait for the next update and return it.
    ///
    /// Returns `None` once the record can no longer change, which is the case
    /// for idle subscriptions and after the entry has been dropped.
    pub async fn changed(&mut self) -> Option<LiveResult<D, E>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Wait until the record satisfies `predicate`, checking the current value
    /// first.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&LiveResult<D, E>) -> bool,
    ) -> Option<LiveResult<D, E>> {
        let value = self.receiver.wait_for(predicate).await.ok()?;
        Some(LiveResult::clone(&value))
    }
}

impl<D, E> Subscription<D, E> {
    /// Producer name followed by the resolved key arguments.
    pub fn key(&self) -> &[Value] {
        &self.key
    }

    /// `None` while the key resolves to nothing.
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn config(&self) -> &SwrConfig {
        &self.config
    }

    pub fn is_validating(&self) -> bool {
        self.receiver.borrow().is_validating
    }

    /// Independent receiver for the record, for use from other tasks.
    pub fn watch(&self) -> watch::Receiver<LiveResult<D, E>> {
        self.receiver.clone()
    }

    fn release(&mut self) {
        if let Some(fingerprint) = self.fingerprint.take() {
            self.context.coordinator().detach(&fingerprint, &self.config);
        }
    }
}

impl<D, E> Drop for Subscription<D, E> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<D, E> fmt::Debug for Subscription<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("producer", &self.producer.name())
            .field("key", &self.key)
            .field("fingerprint", &self.fingerprint)
            .field("is_validating", &self.is_validating())
            .finish()
    }
}

fn attach<D, E>(
    context: &SwrContext<D, E>,
    key: &Key,
    producer: &Producer<D, E>,
    config: &SwrConfig,
) -> Attached<D, E>
where
    D: Clone + Send + Sync + 'static,
    E: Clone + fmt::Display + Send + Sync + 'static,
{
    let mut resolved = vec![Value::String(producer.name().to_string())];

    let Some(args) = key.resolve_args() else {
        debug!(producer = producer.name(), "Subscription idle; key not ready");
        return Attached {
            key: resolved,
            fingerprint: None,
            receiver: SharedResult::new(LiveResult::idle()).subscribe(),
        };
    };

    let fingerprint = context.coordinator().fingerprint(producer.name(), &args);
    resolved.extend(args.iter().cloned());
    let result = context
        .coordinator()
        .attach(&fingerprint, args, producer, config);

    Attached {
        key: resolved,
        fingerprint: Some(fingerprint),
        receiver: result.subscribe(),
    }
}
