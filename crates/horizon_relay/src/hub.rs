//! Channel bookkeeping for connected relay clients.

use dashmap::DashMap;
use horizon_messenger::broker::protocol::RelayOp;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

/// Identifies one client connection for its lifetime.
pub type ClientId = u64;

/// Outbound queue of a client's writer task.
pub type ClientSender = mpsc::UnboundedSender<RelayOp>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub channels: usize,
    pub frames_published: u64,
    pub frames_delivered: u64,
}

/// Tracks which clients are subscribed to which channels.
#[derive(Default)]
pub struct ChannelHub {
    clients: DashMap<ClientId, ClientSender>,
    channels: DashMap<String, HashSet<ClientId>>,
    next_id: AtomicU64,
    frames_published: AtomicU64,
    frames_delivered: AtomicU64,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns its id.
    pub fn register(&self, sender: ClientSender) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.clients.insert(id, sender);
        id
    }

    /// Forgets a connection and every subscription it held.
    pub fn remove(&self, id: ClientId) {
        self.clients.remove(&id);
        self.channels.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
    }

    pub fn subscribe(&self, id: ClientId, channel: &str) {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id);
    }

    /// Returns `false` if the client was not subscribed.
    pub fn unsubscribe(&self, id: ClientId, channel: &str) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut members) => members.remove(&id),
            None => false,
        };
        self.channels.remove_if(channel, |_, members| members.is_empty());
        removed
    }

    /// Queues `payload` for every subscriber of `channel` and returns how
    /// many received it.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        self.frames_published.fetch_add(1, Ordering::Relaxed);

        let members: Vec<ClientId> = match self.channels.get(channel) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for id in members {
            let Some(sender) = self.clients.get(&id) else {
                continue;
            };
            let op = RelayOp::Message {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            if sender.send(op).is_ok() {
                delivered += 1;
            } else {
                trace!(client = id, "Writer gone, skipping");
            }
        }

        self.frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |members| members.len())
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connection_count(),
            channels: self.channel_count(),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
        }
    }
}
