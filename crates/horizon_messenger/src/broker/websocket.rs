//! Pooled WebSocket client for a `horizon_relay` broker.
//!
//! Each pooled connection is one WebSocket. Publishing waits for the relay's
//! acknowledgement; a healthy connection goes back to the idle list when it
//! is dropped. Subscribing dedicates the socket to the subscription, and it is
//! closed rather than pooled once the subscription ends.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::protocol::{ClientOp, RelayOp};
use super::{BrokerConnection, BrokerPool, Subscription};
use crate::config::BrokerSettings;
use crate::error::BrokerError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsPool {
    url: String,
    token: Option<String>,
    idle: Mutex<Vec<WsStream>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl WsPool {
    async fn open(&self) -> Result<WsStream, BrokerError> {
        let (mut stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BrokerError::Unreachable(format!("{}: {e}", self.url)))?;

        if let Some(token) = &self.token {
            send_op(&mut stream, &ClientOp::Auth { token: token.clone() }).await?;
            match next_op(&mut stream).await? {
                RelayOp::AuthOk => {}
                RelayOp::AuthError { message } => return Err(BrokerError::Rejected(message)),
                other => {
                    return Err(BrokerError::Protocol(format!(
                        "expected auth_ok, got {other:?}"
                    )))
                }
            }
        }

        debug!(url = %self.url, "🔗 Opened relay connection");
        Ok(stream)
    }
}

/// Broker pool talking to a relay at `ws://host:port`.
#[derive(Clone)]
pub struct WebSocketBroker {
    pool: Arc<WsPool>,
}

impl WebSocketBroker {
    pub fn new(settings: &BrokerSettings) -> Self {
        Self {
            pool: Arc::new(WsPool {
                url: settings.url(),
                token: settings.token.clone(),
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(settings.pool_size)),
                acquire_timeout: settings.acquire_timeout(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.pool.url
    }

    pub fn idle_connections(&self) -> usize {
        self.pool.idle.lock().len()
    }
}

#[async_trait]
impl BrokerPool for WebSocketBroker {
    async fn acquire(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let permit = match tokio::time::timeout(
            self.pool.acquire_timeout,
            self.pool.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BrokerError::Unreachable("pool closed".to_string())),
            Err(_) => return Err(BrokerError::PoolExhausted(self.pool.acquire_timeout)),
        };

        let reused = self.pool.idle.lock().pop();
        let stream = match reused {
            Some(stream) => stream,
            None => self.pool.open().await?,
        };

        Ok(Box::new(WsConnection {
            pool: self.pool.clone(),
            stream: Some(stream),
            healthy: true,
            _permit: permit,
        }))
    }
}

struct WsConnection {
    pool: Arc<WsPool>,
    stream: Option<WsStream>,
    healthy: bool,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl BrokerConnection for WsConnection {
    async fn publish(&mut self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            BrokerError::Protocol("connection is dedicated to a subscription".to_string())
        })?;

        // Until the ack is read the socket may hold a stale one, so a publish
        // dropped halfway leaves the connection out of the pool.
        self.healthy = false;
        let result = publish_on(stream, channel, payload).await;
        self.healthy = matches!(result, Ok(()) | Err(BrokerError::Rejected(_)));
        result
    }

    async fn subscribe(&mut self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let mut stream = self.stream.take().ok_or_else(|| {
            BrokerError::Protocol("connection is already subscribed".to_string())
        })?;

        send_op(
            &mut stream,
            &ClientOp::Subscribe {
                channel: channel.to_string(),
            },
        )
        .await?;
        loop {
            match next_op(&mut stream).await? {
                RelayOp::Subscribed { .. } => break,
                RelayOp::Error { message } | RelayOp::AuthError { message } => {
                    return Err(BrokerError::Rejected(message))
                }
                other => trace!("Ignoring {:?} while subscribing", other),
            }
        }

        Ok(Box::new(WsSubscription {
            stream: Some(stream),
            channel: channel.to_string(),
        }))
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        if !self.healthy {
            return;
        }
        if let Some(stream) = self.stream.take() {
            self.pool.idle.lock().push(stream);
        }
    }
}

struct WsSubscription {
    stream: Option<WsStream>,
    channel: String,
}

#[async_trait]
impl Subscription for WsSubscription {
    async fn next_frame(&mut self) -> Option<Result<String, BrokerError>> {
        let stream = self.stream.as_mut()?;
        loop {
            match next_op(stream).await {
                Ok(RelayOp::Message { payload, .. }) => return Some(Ok(payload)),
                Ok(RelayOp::Error { message }) => return Some(Err(BrokerError::Protocol(message))),
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), BrokerError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        send_op(
            &mut stream,
            &ClientOp::Unsubscribe {
                channel: self.channel.clone(),
            },
        )
        .await?;
        stream
            .close(None)
            .await
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))
    }
}

async fn publish_on(stream: &mut WsStream, channel: &str, payload: &str) -> Result<(), BrokerError> {
    send_op(
        stream,
        &ClientOp::Publish {
            channel: channel.to_string(),
            payload: payload.to_string(),
        },
    )
    .await?;

    loop {
        match next_op(stream).await? {
            RelayOp::Published {
                channel: acked,
                receivers,
            } => {
                if acked != channel {
                    return Err(BrokerError::Protocol(format!(
                        "publish on {channel} acknowledged for {acked}"
                    )));
                }
                trace!(channel, receivers, "Publish acknowledged");
                return Ok(());
            }
            RelayOp::Error { message } | RelayOp::AuthError { message } => {
                return Err(BrokerError::Rejected(message))
            }
            other => trace!("Ignoring {:?} while publishing", other),
        }
    }
}

async fn send_op(stream: &mut WsStream, op: &ClientOp) -> Result<(), BrokerError> {
    let text = serde_json::to_string(op).map_err(|e| BrokerError::Protocol(e.to_string()))?;
    stream
        .send(WsMessage::text(text))
        .await
        .map_err(|e| BrokerError::ConnectionLost(e.to_string()))
}

/// Reads the next relay op, skipping control frames.
async fn next_op(stream: &mut WsStream) -> Result<RelayOp, BrokerError> {
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|e| BrokerError::Protocol(format!("invalid relay frame: {e}")))
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(BrokerError::ConnectionLost(
                    "relay closed the connection".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(BrokerError::ConnectionLost(e.to_string())),
        }
    }
}
