//! Producer invocation and the per-fingerprint fetch state machine.

mod coordinator;
mod producer;
mod result;

pub use coordinator::{FetchCoordinator, ResultStore, SessionState};
pub use producer::{Cleanup, Observer, Producer, ProducerEvent, ProducerResult};
pub use result::{LiveResult, SharedResult};
