//! Stale-while-revalidate synchronisation engine.
//!
//! Callers [`subscribe`](SwrContext::subscribe) to a key with a producer and
//! get back a live [`Subscription`]. Subscriptions to the same key share one
//! record and one fetch session: the producer runs once, its result is cached
//! with a TTL, failures are retried and successes optionally refreshed on an
//! interval. [`mutate`](SwrContext::mutate) writes values directly.
//!
//! ```no_run
//! use swrkit::{Producer, ProducerError, SwrContext};
//!
//! # async fn demo() {
//! let ctx: SwrContext<String> = SwrContext::default();
//! let producer = Producer::from_async(|args| async move {
//!     Ok::<_, ProducerError>(format!("loaded {}", args[0]))
//! });
//!
//! let mut user = ctx.subscribe("user/1", producer);
//! let ready = user.wait_for(|result| result.data.is_some()).await;
//! println!("{:?}", ready.and_then(|result| result.data));
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod fetch;
pub mod infra;
pub mod subscription;

pub use cache::{CacheEntry, CacheStore, Fingerprint, Key, MemoryStore, SwrConfig};
pub use context::{MutateOptions, Mutation, SwrContext};
pub use fetch::{
    Cleanup, LiveResult, Observer, Producer, ProducerEvent, ProducerResult, SessionState,
    SharedResult,
};
pub use infra::error::{KeyError, ProducerError, SwrError};
pub use subscription::Subscription;
