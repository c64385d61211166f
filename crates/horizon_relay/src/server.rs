//! WebSocket front end of the relay.
//!
//! Every accepted connection gets a writer task draining its outbound queue
//! and a reader loop that applies [`ClientOp`]s to the shared [`ChannelHub`].

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use horizon_messenger::broker::protocol::{ClientOp, RelayOp};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::hub::{ChannelHub, ClientId, ClientSender};

/// A relay that has not been bound yet.
pub struct RelayServer {
    bind_address: SocketAddr,
    auth_token: Option<String>,
    hub: Arc<ChannelHub>,
}

impl RelayServer {
    /// `auth_token`, when set, must be presented by every client before any
    /// other operation.
    pub fn new(bind_address: SocketAddr, auth_token: Option<String>) -> Self {
        Self {
            bind_address,
            auth_token,
            hub: Arc::new(ChannelHub::new()),
        }
    }

    pub fn hub(&self) -> Arc<ChannelHub> {
        self.hub.clone()
    }

    /// Binds the listener and starts accepting in the background.
    pub async fn start(self) -> anyhow::Result<RelayHandle> {
        let listener = TcpListener::bind(self.bind_address)
            .await
            .with_context(|| format!("Failed to bind relay to {}", self.bind_address))?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!("🌐 Relay listening on {}", local_addr);
        let task = tokio::spawn(accept_loop(
            listener,
            self.hub.clone(),
            Arc::new(self.auth_token),
            shutdown_rx,
        ));

        Ok(RelayHandle {
            local_addr,
            hub: self.hub,
            shutdown,
            task,
        })
    }
}

/// A running relay. Dropping the handle stops it as well.
pub struct RelayHandle {
    local_addr: SocketAddr,
    hub: Arc<ChannelHub>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }

    /// Stops accepting and closes every client connection.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            error!("❌ Relay accept loop failed: {}", e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    hub: Arc<ChannelHub>,
    auth_token: Arc<Option<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        addr,
                        hub.clone(),
                        auth_token.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!("⚠️ Failed to accept connection: {}", e),
            },
        }
    }
    info!("🛑 Relay stopped accepting connections");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<ChannelHub>,
    auth_token: Arc<Option<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut sink, mut receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayOp>();
    let client_id = hub.register(tx.clone());
    debug!(client = client_id, %addr, "Client connected");

    let writer = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let text = match serde_json::to_string(&op) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode relay op: {}", e);
                    continue;
                }
            };
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session {
        id: client_id,
        hub: hub.clone(),
        tx,
        auth_token,
        authenticated: false,
    };
    session.authenticated = session.auth_token.is_none();

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = receiver.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                if !session.handle(text.as_str()) {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(client = client_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    hub.remove(client_id);
    // Dropping the last sender lets the writer flush and close the socket.
    drop(session);
    let _ = writer.await;
    debug!(client = client_id, %addr, "Client disconnected");
}

/// Per-connection protocol state.
struct Session {
    id: ClientId,
    hub: Arc<ChannelHub>,
    tx: ClientSender,
    auth_token: Arc<Option<String>>,
    authenticated: bool,
}

impl Session {
    fn reply(&self, op: RelayOp) {
        let _ = self.tx.send(op);
    }

    /// Applies one client frame. Returns `false` when the connection must
    /// be closed.
    fn handle(&mut self, text: &str) -> bool {
        let op: ClientOp = match serde_json::from_str(text) {
            Ok(op) => op,
            Err(e) => {
                self.reply(RelayOp::Error {
                    message: format!("invalid frame: {e}"),
                });
                return true;
            }
        };

        if let ClientOp::Auth { token } = &op {
            return self.authenticate(token);
        }
        if !self.authenticated {
            self.reply(RelayOp::AuthError {
                message: "authentication required".to_string(),
            });
            return false;
        }

        match op {
            ClientOp::Auth { .. } => {}
            ClientOp::Subscribe { channel } => {
                self.hub.subscribe(self.id, &channel);
                debug!(client = self.id, %channel, "Subscribed");
                self.reply(RelayOp::Subscribed { channel });
            }
            ClientOp::Unsubscribe { channel } => {
                self.hub.unsubscribe(self.id, &channel);
                debug!(client = self.id, %channel, "Unsubscribed");
                self.reply(RelayOp::Unsubscribed { channel });
            }
            ClientOp::Publish { channel, payload } => {
                let receivers = self.hub.publish(&channel, &payload);
                self.reply(RelayOp::Published { channel, receivers });
            }
        }
        true
    }

    fn authenticate(&mut self, token: &str) -> bool {
        match self.auth_token.as_deref() {
            Some(expected) if expected != token => {
                warn!(client = self.id, "🔒 Rejected client with a bad token");
                self.reply(RelayOp::AuthError {
                    message: "invalid token".to_string(),
                });
                false
            }
            _ => {
                self.authenticated = true;
                self.reply(RelayOp::AuthOk);
                true
            }
        }
    }
}
