//! Producers and their normalisation into a single event stream.
//!
//! A producer may hand back a ready value, a future, or a streaming source
//! that pushes events into an [`Observer`]. Whatever the shape, the fetch
//! driver only ever sees a stream of [`ProducerEvent`]s ending in `Complete`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

/// Teardown hook returned by streaming producers.
pub type Cleanup = Box<dyn FnOnce() + Send>;

type StreamSource<D, E> = Box<dyn FnOnce(Observer<D, E>) -> Option<Cleanup> + Send>;
type ProducerFn<D, E> = dyn Fn(&[Value]) -> ProducerResult<D, E> + Send + Sync;

/// One event of a producer run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerEvent<D, E> {
    Next(D),
    Error(E),
    Complete,
}

/// What a producer call hands back.
pub enum ProducerResult<D, E> {
    /// A value available immediately.
    Value(D),
    /// A synchronous failure.
    Error(E),
    /// A value that will be available later.
    Deferred(BoxFuture<'static, Result<D, E>>),
    /// A source that pushes any number of events and may return a cleanup.
    Stream(StreamSource<D, E>),
}

impl<D, E> ProducerResult<D, E> {
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<D, E>> + Send + 'static,
    {
        Self::Deferred(Box::pin(future))
    }

    pub fn stream<F>(source: F) -> Self
    where
        F: FnOnce(Observer<D, E>) -> Option<Cleanup> + Send + 'static,
    {
        Self::Stream(Box::new(source))
    }
}

impl<D, E> From<Result<D, E>> for ProducerResult<D, E> {
    fn from(result: Result<D, E>) -> Self {
        match result {
            Ok(data) => Self::Value(data),
            Err(error) => Self::Error(error),
        }
    }
}

impl<D, E> fmt::Debug for ProducerResult<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            Self::Value(_) => "Value",
            Self::Error(_) => "Error",
            Self::Deferred(_) => "Deferred",
            Self::Stream(_) => "Stream",
        };
        f.debug_tuple("ProducerResult").field(&shape).finish()
    }
}

/// Sink handed to streaming producers.
///
/// Events sent after the session has been torn down are dropped.
pub struct Observer<D, E> {
    sender: mpsc::UnboundedSender<ProducerEvent<D, E>>,
}

impl<D, E> Observer<D, E> {
    pub fn next(&self, data: D) {
        let _ = self.sender.unbounded_send(ProducerEvent::Next(data));
    }

    pub fn error(&self, error: E) {
        let _ = self.sender.unbounded_send(ProducerEvent::Error(error));
    }

    pub fn complete(&self) {
        let _ = self.sender.unbounded_send(ProducerEvent::Complete);
        self.sender.close_channel();
    }

    /// Whether the receiving session is gone.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<D, E> Clone for Observer<D, E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// A named function from resolved key arguments to a [`ProducerResult`].
///
/// The name scopes the fingerprint, so two producers with different names
/// never share a cache entry for the same key.
pub struct Producer<D, E> {
    name: Arc<str>,
    call: Arc<ProducerFn<D, E>>,
}

impl<D, E> Producer<D, E>
where
    D: Send + 'static,
    E: Send + 'static,
{
    pub fn new<F>(call: F) -> Self
    where
        F: Fn(&[Value]) -> ProducerResult<D, E> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(""),
            call: Arc::new(call),
        }
    }

    /// Producer returning its value synchronously.
    pub fn from_fn<F>(call: F) -> Self
    where
        F: Fn(&[Value]) -> Result<D, E> + Send + Sync + 'static,
    {
        Self::new(move |args| call(args).into())
    }

    /// Producer returning a future.
    pub fn from_async<F, Fut>(call: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D, E>> + Send + 'static,
    {
        Self::new(move |args| ProducerResult::deferred(call(args.to_vec())))
    }

    /// Producer pushing events into an observer.
    pub fn from_stream<F>(call: F) -> Self
    where
        F: Fn(Vec<Value>, Observer<D, E>) -> Option<Cleanup> + Send + Sync + 'static,
    {
        let call = Arc::new(call);
        Self::new(move |args| {
            let call = Arc::clone(&call);
            let args = args.to_vec();
            ProducerResult::stream(move |observer| call(args, observer))
        })
    }

    pub fn named(mut self, name: impl AsRef<str>) -> Self {
        self.name = Arc::from(name.as_ref());
        self
    }
}

impl<D, E> Producer<D, E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, args: &[Value]) -> ProducerResult<D, E> {
        (self.call)(args)
    }
}

impl<D, E> Clone for Producer<D, E> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            call: Arc::clone(&self.call),
        }
    }
}

impl<D, E> fmt::Debug for Producer<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").field("name", &self.name).finish()
    }
}

/// Events of one producer run plus the cleanup of a streaming source.
pub(crate) struct Tick<D, E> {
    pub events: BoxStream<'static, ProducerEvent<D, E>>,
    pub cleanup: Option<Cleanup>,
}

/// Adapt any producer shape into a stream of events.
///
/// Values and futures yield exactly one `Next` or `Error` followed by
/// `Complete`. Streaming sources yield whatever they push; their stream ends
/// after `Complete` or once every observer clone is dropped.
pub(crate) fn normalize<D, E>(result: ProducerResult<D, E>) -> Tick<D, E>
where
    D: Send + 'static,
    E: Send + 'static,
{
    match result {
        ProducerResult::Value(data) => Tick {
            events: stream::iter([ProducerEvent::Next(data), ProducerEvent::Complete]).boxed(),
            cleanup: None,
        },
        ProducerResult::Error(error) => Tick {
            events: stream::iter([ProducerEvent::Error(error), ProducerEvent::Complete]).boxed(),
            cleanup: None,
        },
        ProducerResult::Deferred(future) => Tick {
            events: stream::once(future)
                .flat_map(|outcome| {
                    let event = match outcome {
                        Ok(data) => ProducerEvent::Next(data),
                        Err(error) => ProducerEvent::Error(error),
                    };
                    stream::iter([event, ProducerEvent::Complete])
                })
                .boxed(),
            cleanup: None,
        },
        ProducerResult::Stream(source) => {
            let (sender, receiver) = mpsc::unbounded();
            let cleanup = source(Observer { sender });
            Tick {
                events: receiver.boxed(),
                cleanup,
            }
        }
    }
}
