//! Publish/subscribe broker seam.
//!
//! A [`BrokerPool`] hands out [`BrokerConnection`]s that return their slot to
//! the pool when dropped, so every exit path of a publish releases the
//! connection. A subscription keeps its connection checked out for as long as
//! the subscriber loop holds it.

use async_trait::async_trait;

use crate::error::BrokerError;

pub mod memory;
pub mod protocol;
pub mod websocket;

pub use memory::MemoryBroker;
pub use websocket::WebSocketBroker;

/// Source of pooled broker connections.
#[async_trait]
pub trait BrokerPool: Send + Sync + 'static {
    /// Checks out a connection, waiting up to the pool's acquire timeout.
    async fn acquire(&self) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// A checked-out connection. Dropping it releases it back to the pool.
#[async_trait]
pub trait BrokerConnection: Send {
    async fn publish(&mut self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Opens a subscription on `channel`.
    ///
    /// A connection that is subscribing may not be usable for publishing
    /// afterwards; callers keep it only to hold the pool slot.
    async fn subscribe(&mut self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError>;
}

/// A live subscription on one channel.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next frame.
    ///
    /// `None` means the subscription ended normally, `Some(Err(_))` means it
    /// was lost. Must be cancel-safe: the subscriber loop races it against
    /// shutdown.
    async fn next_frame(&mut self) -> Option<Result<String, BrokerError>>;

    /// Ends the subscription. Later calls to `next_frame` return `None`.
    async fn unsubscribe(&mut self) -> Result<(), BrokerError>;
}
