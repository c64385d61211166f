//! In-process broker.
//!
//! Every clone shares the same channels, so two messengers built on clones of
//! one `MemoryBroker` behave like two processes on one broker. The pool is a
//! semaphore, and [`MemoryBroker::sever`] / [`MemoryBroker::set_reachable`]
//! simulate outages.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::{BrokerConnection, BrokerPool, Subscription};
use crate::error::BrokerError;

type FrameSender = mpsc::UnboundedSender<Result<String, BrokerError>>;

struct Subscriber {
    channel: String,
    tx: FrameSender,
}

struct MemoryInner {
    subscribers: DashMap<u64, Subscriber>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    reachable: AtomicBool,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl MemoryInner {
    fn check_reachable(&self) -> Result<(), BrokerError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unreachable("memory broker is offline".to_string()))
        }
    }
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

impl MemoryBroker {
    pub fn new(pool_size: usize) -> Self {
        Self::with_acquire_timeout(pool_size, Duration::from_secs(10))
    }

    pub fn with_acquire_timeout(pool_size: usize, acquire_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                subscribers: DashMap::new(),
                permits: Arc::new(Semaphore::new(pool_size)),
                acquire_timeout,
                reachable: AtomicBool::new(true),
                next_id: AtomicU64::new(0),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Drops every live subscription with a connection-lost error.
    ///
    /// Returns how many subscriptions were cut.
    pub fn sever(&self) -> usize {
        let ids: Vec<u64> = self.inner.subscribers.iter().map(|entry| *entry.key()).collect();
        let mut severed = 0;
        for id in ids {
            if let Some((_, subscriber)) = self.inner.subscribers.remove(&id) {
                let _ = subscriber.tx.send(Err(BrokerError::ConnectionLost(
                    "subscription severed".to_string(),
                )));
                severed += 1;
            }
        }
        debug!("🔌 Severed {} memory subscriptions", severed);
        severed
    }

    /// While unreachable, acquire, publish and subscribe all fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .subscribers
            .iter()
            .filter(|entry| entry.value().channel == channel)
            .count()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn available_connections(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(12)
    }
}

#[async_trait]
impl BrokerPool for MemoryBroker {
    async fn acquire(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        self.inner.check_reachable()?;
        let permit = match tokio::time::timeout(
            self.inner.acquire_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BrokerError::Unreachable("pool closed".to_string())),
            Err(_) => return Err(BrokerError::PoolExhausted(self.inner.acquire_timeout)),
        };

        Ok(Box::new(MemoryConnection {
            inner: self.inner.clone(),
            _permit: permit,
        }))
    }
}

struct MemoryConnection {
    inner: Arc<MemoryInner>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn publish(&mut self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        self.inner.check_reachable()?;
        for entry in self.inner.subscribers.iter() {
            if entry.value().channel == channel {
                let _ = entry.value().tx.send(Ok(payload.to_string()));
            }
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        self.inner.check_reachable()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.insert(
            id,
            Subscriber {
                channel: channel.to_string(),
                tx,
            },
        );
        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            id,
            rx,
        }))
    }
}

struct MemorySubscription {
    inner: Arc<MemoryInner>,
    id: u64,
    rx: mpsc::UnboundedReceiver<Result<String, BrokerError>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_frame(&mut self) -> Option<Result<String, BrokerError>> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<(), BrokerError> {
        self.inner.subscribers.remove(&self.id);
        self.rx.close();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.inner.subscribers.remove(&self.id);
    }
}
