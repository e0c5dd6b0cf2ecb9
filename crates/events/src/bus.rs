//! Publish/subscribe abstraction (mechanics only).
//!
//! - **Transport-agnostic**: in-memory channels today, a broker tomorrow.
//! - **At-least-once**: consumers must tolerate duplicates.
//! - **No persistence**: the stores are the source of truth; a lost
//!   notification never loses state.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`EventBus::publish`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Internal lock poisoned by a panicking publisher.
    #[error("event bus lock poisoned")]
    Poisoned,

    /// Transport-level failure (broker unreachable, queue full, ...).
    #[error("event bus transport error: {0}")]
    Transport(String),
}

/// A subscription to the bus.
///
/// Each subscription receives a copy of every message published after it was
/// created (broadcast semantics). Intended for a single consumer, which
/// must keep draining: a bus may disconnect a subscriber that falls behind.
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(message) => handle(message),
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Domain-agnostic pub/sub bus.
///
/// `publish` is called after the corresponding store write succeeded, so a
/// failure here is reported to the caller but never rolls anything back.
/// Implementations must be `Send + Sync`; publishers run on many tasks.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

/// Publish and log instead of failing.
///
/// Used on paths where the state change already committed and a lost
/// notification must not turn into an error for the caller.
pub fn publish_best_effort<M, B>(bus: &B, message: M)
where
    B: EventBus<M> + ?Sized,
{
    if let Err(err) = bus.publish(message) {
        tracing::warn!(error = %err, "failed to publish notification");
    }
}
