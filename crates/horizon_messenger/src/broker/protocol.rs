//! Relay wire protocol.
//!
//! JSON text frames over a WebSocket, tagged by `op`. Shared by
//! [`WebSocketBroker`](super::WebSocketBroker) and the relay server so both
//! ends stay in sync.

use serde::{Deserialize, Serialize};

/// Operations sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientOp {
    Auth { token: String },
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, payload: String },
}

/// Operations sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayOp {
    AuthOk,
    AuthError { message: String },
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    /// Publish acknowledged; `receivers` is how many subscriptions got it
    Published { channel: String, receivers: usize },
    /// A frame published on a channel this connection subscribed to
    Message { channel: String, payload: String },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_op_wire_format() {
        let op = ClientOp::Publish {
            channel: "horizon:messenger".into(),
            payload: "{}".into(),
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            serde_json::json!({ "op": "publish", "channel": "horizon:messenger", "payload": "{}" })
        );
    }

    #[test]
    fn test_relay_op_parsing() {
        let op: RelayOp = serde_json::from_str(r#"{"op":"auth_ok"}"#).unwrap();
        assert_eq!(op, RelayOp::AuthOk);

        let op: RelayOp =
            serde_json::from_str(r#"{"op":"published","channel":"c","receivers":3}"#).unwrap();
        assert_eq!(
            op,
            RelayOp::Published {
                channel: "c".into(),
                receivers: 3
            }
        );
    }
}
