//! Request identities and their fingerprints.
//!
//! A [`Key`] is what callers hand to `subscribe`/`mutate`. It resolves to an
//! ordered list of arguments (or to nothing, when the identity is not ready)
//! and the arguments are folded into a [`Fingerprint`] that names the cache
//! entry.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::infra::error::KeyError;

type KeyThunk = Arc<dyn Fn() -> Result<Option<Vec<Value>>, KeyError> + Send + Sync>;

/// Identity of a request.
#[derive(Clone, Default)]
pub enum Key {
    /// No identity; subscriptions stay idle and mutations are skipped.
    #[default]
    Absent,
    /// A single literal string.
    Literal(String),
    /// Positional arguments handed to the producer.
    Args(Vec<Value>),
    /// Arguments computed on demand. A failing thunk means "not ready yet".
    Deferred(KeyThunk),
}

impl Key {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    pub fn args<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::Args(values.into_iter().map(Into::into).collect())
    }

    /// Build a key whose arguments are computed each time it is resolved.
    pub fn deferred<F>(thunk: F) -> Self
    where
        F: Fn() -> Result<Option<Vec<Value>>, KeyError> + Send + Sync + 'static,
    {
        Self::Deferred(Arc::new(thunk))
    }

    /// Resolve the identity to the producer's positional arguments.
    ///
    /// A literal becomes a one-element list. Returns `None` when there is no
    /// identity, including when a deferred key reports that its dependencies
    /// are not ready.
    pub fn resolve_args(&self) -> Option<Vec<Value>> {
        match self {
            Self::Absent => None,
            Self::Literal(value) => Some(vec![Value::String(value.clone())]),
            Self::Args(values) => Some(values.clone()),
            Self::Deferred(thunk) => match thunk() {
                Ok(values) => values,
                Err(err) => {
                    tracing::debug!(error = %err, "Deferred key not ready");
                    None
                }
            },
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("Absent"),
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Args(values) => f.debug_tuple("Args").field(values).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::literal(value)
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::Literal(value)
    }
}

impl From<Vec<Value>> for Key {
    fn from(values: Vec<Value>) -> Self {
        Self::Args(values)
    }
}

impl<T: Into<Key>> From<Option<T>> for Key {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Absent, Into::into)
    }
}

/// Canonical string naming one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint for `args` produced by the producer called `scope`.
    ///
    /// An empty scope yields the bare content hash of the arguments, which is
    /// what out-of-band mutations of the same key compute.
    pub fn of(scope: &str, args: &[Value]) -> Self {
        Self::with(scope, args, serialize)
    }

    /// Like [`Fingerprint::of`], with `serialize_key` turning the argument
    /// list into a string. Stores plug their own serialization in here.
    pub fn with(
        scope: &str,
        args: &[Value],
        serialize_key: impl FnOnce(&Key) -> String,
    ) -> Self {
        if scope.is_empty() {
            return Self(serialize_key(&Key::Args(args.to_vec())));
        }
        let mut scoped = Vec::with_capacity(args.len() + 1);
        scoped.push(Value::String(scope.to_string()));
        scoped.extend_from_slice(args);
        Self(format!("{scope}@{}", serialize_key(&Key::Args(scoped))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Serialize an identity into a stable string.
///
/// Deferred keys are invoked (a failure serializes as the empty string),
/// argument lists are content-hashed, literals pass through and an absent
/// key becomes the empty string.
pub fn serialize(key: &Key) -> String {
    match key {
        Key::Absent => String::new(),
        Key::Literal(value) => value.clone(),
        Key::Args(values) => hash_values(values),
        Key::Deferred(thunk) => match thunk() {
            Ok(Some(values)) => hash_values(&values),
            Ok(None) | Err(_) => String::new(),
        },
    }
}

/// Content hash of an argument list.
///
/// `serde_json` keeps object keys sorted, so structurally equal values encode
/// to the same bytes regardless of how they were built.
pub fn hash_values(values: &[Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"[");
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            hasher.update(b",");
        }
        hasher.update(value.to_string().as_bytes());
    }
    hasher.update(b"]");
    format!("arg@{}", hex::encode(hasher.finalize().as_slice()))
}
