//! # Horizon Relay
//!
//! A small pub/sub broker for Horizon messengers. Clients connect over
//! WebSocket, subscribe to channels and publish text frames; every publish is
//! fanned out to all subscriptions on the channel, the publisher's included.
//!
//! The wire protocol lives in [`horizon_messenger::broker::protocol`] so the
//! client pool and this server cannot drift apart.

pub mod cli;
pub mod config;
pub mod hub;
pub mod logging;
pub mod server;
pub mod signals;

pub use config::AppConfig;
pub use hub::{ChannelHub, ClientId, HubStats};
pub use server::{RelayHandle, RelayServer};
