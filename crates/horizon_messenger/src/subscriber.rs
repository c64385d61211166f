//! Background subscriber loop.
//!
//! Holds one subscription on the shared channel and hands every frame to a
//! [`FrameSink`]. When the subscription is lost it unsubscribes best-effort,
//! waits a fixed backoff and tries again, forever, until shutdown is signalled.
//!
//! ```text
//! Idle -> Starting -> Subscribed -> Reconnecting -> Starting ...
//!                 \________________________________-> Closed
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConnection, BrokerPool, Subscription};
use crate::error::BrokerError;
use crate::router::FrameOutcome;
use crate::stats::{bump, StatsCounters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// `connect()` has not been called
    Idle,
    /// Acquiring a connection and subscribing
    Starting,
    Subscribed,
    /// Waiting out the backoff after a lost subscription
    Reconnecting,
    /// Terminal, entered only after shutdown
    Closed,
}

/// Receives frames read by the loop.
#[async_trait]
pub(crate) trait FrameSink: Send + Sync {
    async fn on_frame(&self, raw: &str) -> FrameOutcome;
}

pub(crate) struct SubscriberLoop {
    pool: Arc<dyn BrokerPool>,
    channel: String,
    backoff: Duration,
    sink: Arc<dyn FrameSink>,
    state: Arc<watch::Sender<LoopState>>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<StatsCounters>,
    has_subscribed: bool,
}

impl SubscriberLoop {
    pub(crate) fn new(
        pool: Arc<dyn BrokerPool>,
        channel: String,
        backoff: Duration,
        sink: Arc<dyn FrameSink>,
        state: Arc<watch::Sender<LoopState>>,
        shutdown: watch::Receiver<bool>,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            pool,
            channel,
            backoff,
            sink,
            state,
            shutdown,
            stats,
            has_subscribed: false,
        }
    }

    /// Shutdown was requested, or the messenger was dropped.
    fn is_closing(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    pub(crate) async fn run(mut self) {
        debug!(channel = %self.channel, "Subscriber loop started");

        while !self.is_closing() {
            self.set_state(LoopState::Starting);
            let result = self.subscribe_once().await;
            if self.is_closing() {
                break;
            }

            match result {
                Ok(()) => warn!(channel = %self.channel, "⚠️ Subscription ended unexpectedly"),
                Err(error) if self.has_subscribed => {
                    warn!(channel = %self.channel, %error, "⚠️ Lost connection to broker")
                }
                Err(error) => {
                    warn!(channel = %self.channel, %error, "⚠️ Could not subscribe to broker")
                }
            }

            self.set_state(LoopState::Reconnecting);
            debug!("Retrying in {:?}", self.backoff);
            tokio::select! {
                _ = tokio::time::sleep(self.backoff) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        self.set_state(LoopState::Closed);
        info!(channel = %self.channel, "🛑 Subscriber loop closed");
    }

    /// One subscription lifetime. Returns when the subscription ends, fails
    /// or shutdown is signalled.
    async fn subscribe_once(&mut self) -> Result<(), BrokerError> {
        // The connection stays checked out for as long as the subscription lives.
        let (connection, mut subscription) = tokio::select! {
            _ = self.shutdown.changed() => return Ok(()),
            opened = open(self.pool.as_ref(), &self.channel) => opened?,
        };

        if self.has_subscribed {
            bump(&self.stats.reconnects);
            info!(channel = %self.channel, "🔄 Reconnected to broker");
        } else {
            info!(channel = %self.channel, "📡 Subscribed to broker");
        }
        self.has_subscribed = true;
        self.set_state(LoopState::Subscribed);

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.changed() => break Ok(()),
                frame = subscription.next_frame() => match frame {
                    Some(Ok(raw)) => {
                        self.sink.on_frame(&raw).await;
                    }
                    Some(Err(error)) => break Err(error),
                    None => break Ok(()),
                },
            }
        };

        if let Err(error) = subscription.unsubscribe().await {
            debug!(%error, "Ignoring unsubscribe failure");
        }
        drop(subscription);
        drop(connection);
        outcome
    }
}

// Watchers see Closed even if the task is aborted or unwinds.
impl Drop for SubscriberLoop {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if *state == LoopState::Closed {
                return false;
            }
            *state = LoopState::Closed;
            true
        });
    }
}

async fn open(
    pool: &dyn BrokerPool,
    channel: &str,
) -> Result<(Box<dyn BrokerConnection>, Box<dyn Subscription>), BrokerError> {
    let mut connection = pool.acquire().await?;
    let subscription = connection.subscribe(channel).await?;
    Ok((connection, subscription))
}
