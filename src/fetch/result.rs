//! The live result record shared by every observer of one fingerprint.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Snapshot of a fingerprint's state as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveResult<D, E> {
    /// Last successfully produced value. Survives later errors.
    pub data: Option<D>,
    /// Error of the most recent failed attempt, cleared by the next success.
    pub error: Option<E>,
    /// Whether a producer call is expected to deliver an update.
    pub is_validating: bool,
}

impl<D, E> LiveResult<D, E> {
    /// A record waiting on its first producer call.
    pub fn pending() -> Self {
        Self {
            data: None,
            error: None,
            is_validating: true,
        }
    }

    /// A record nobody is fetching for.
    pub fn idle() -> Self {
        Self {
            data: None,
            error: None,
            is_validating: false,
        }
    }
}

impl<D, E> Default for LiveResult<D, E> {
    fn default() -> Self {
        Self::pending()
    }
}

/// Handle to a live result.
///
/// Clones share the same record; writes go through [`SharedResult::update`]
/// and are broadcast to every receiver obtained from
/// [`SharedResult::subscribe`]. The record's identity is fixed for the life of
/// the cache entry that owns it.
pub struct SharedResult<D, E> {
    sender: Arc<watch::Sender<LiveResult<D, E>>>,
}

impl<D, E> SharedResult<D, E> {
    pub fn new(initial: LiveResult<D, E>) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Mutate the record in place and notify every receiver.
    pub fn update(&self, modify: impl FnOnce(&mut LiveResult<D, E>)) {
        self.sender.send_modify(modify);
    }

    /// Read-only handle that is woken on every update.
    pub fn subscribe(&self) -> watch::Receiver<LiveResult<D, E>> {
        self.sender.subscribe()
    }

    pub fn is_validating(&self) -> bool {
        self.sender.borrow().is_validating
    }

    /// Whether both handles point at the same record.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.sender, &other.sender)
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<D: Clone, E: Clone> SharedResult<D, E> {
    pub fn snapshot(&self) -> LiveResult<D, E> {
        self.sender.borrow().clone()
    }
}

impl<D, E> Clone for SharedResult<D, E> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<D: fmt::Debug, E: fmt::Debug> fmt::Debug for SharedResult<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedResult")
            .field(&*self.sender.borrow())
            .finish()
    }
}
