//! Data types carried over the shared channel.
//!
//! A [`Message`] is a type tag plus a serialized body. A [`Conversation`] adds
//! a correlation id and a direction; request conversations additionally own
//! the callback that resolves them, which never leaves the initiating process.
//! On the wire both are written as an [`Envelope`], and inbound envelopes are
//! classified into the closed [`Frame`] enum before any routing happens.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::callback::ConversationCallback;
use crate::error::SerializerError;

/// A value that can travel over the channel.
///
/// Implemented for every serde type, the tag is the Rust type path, so both
/// ends must agree on it (shared crate or identical module path).
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable identifier written into the envelope's `type` field.
    fn type_tag() -> &'static str;
}

impl<T> Payload for T
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn type_tag() -> &'static str {
        std::any::type_name::<T>()
    }
}

/// An immutable, already-serialized payload and its type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    type_tag: String,
    body: String,
}

impl Message {
    pub fn new(type_tag: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            body: body.into(),
        }
    }

    /// Serializes `payload` to JSON and tags it with its type.
    pub fn from_payload<T: Payload>(payload: &T) -> Result<Self, SerializerError> {
        Ok(Self {
            type_tag: T::type_tag().to_string(),
            body: serde_json::to_string(payload)?,
        })
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Whether this message was tagged as a `T`.
    pub fn is<T: Payload>(&self) -> bool {
        self.type_tag == T::type_tag()
    }

    /// Decodes the body as `T`.
    pub fn decode<T: Payload>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Correlates a response with the request that started the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConversationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    Request,
    Response,
}

enum Role {
    Request(Box<dyn ConversationCallback>),
    Response,
}

/// A correlated message.
///
/// Built with [`Conversation::request`] (fresh id, owns its callback) or
/// [`Conversation::response`] (echoes the id it answers).
pub struct Conversation {
    message: Message,
    id: ConversationId,
    role: Role,
}

impl Conversation {
    pub fn request(message: Message, callback: Box<dyn ConversationCallback>) -> Self {
        Self {
            message,
            id: ConversationId::new(),
            role: Role::Request(callback),
        }
    }

    pub fn response(message: Message, id: ConversationId) -> Self {
        Self {
            message,
            id,
            role: Role::Response,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn kind(&self) -> ConversationKind {
        match self.role {
            Role::Request(_) => ConversationKind::Request,
            Role::Response => ConversationKind::Response,
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (Message, ConversationId, Option<Box<dyn ConversationCallback>>) {
        let callback = match self.role {
            Role::Request(callback) => Some(callback),
            Role::Response => None,
        };
        (self.message, self.id, callback)
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("message", &self.message)
            .field("id", &self.id)
            .field("kind", &self.kind())
            .finish()
    }
}

/// The JSON object published for every frame.
///
/// `conversation_id` and `kind` are omitted for plain messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ConversationKind>,
}

impl Envelope {
    pub fn plain(message: &Message) -> Self {
        Self {
            type_tag: message.type_tag.clone(),
            body: message.body.clone(),
            conversation_id: None,
            kind: None,
        }
    }

    pub fn conversation(message: &Message, id: ConversationId, kind: ConversationKind) -> Self {
        Self {
            type_tag: message.type_tag.clone(),
            body: message.body.clone(),
            conversation_id: Some(id),
            kind: Some(kind),
        }
    }

    /// Decides what this envelope is.
    ///
    /// A present `kind` makes it a conversation, which then must carry an id.
    /// Without `kind` it is a plain message and a stray id is ignored.
    pub fn classify(self) -> Result<Frame, SerializerError> {
        let message = Message::new(self.type_tag, self.body);
        match (self.kind, self.conversation_id) {
            (None, _) => Ok(Frame::Plain(message)),
            (Some(ConversationKind::Request), Some(id)) => Ok(Frame::Request { message, id }),
            (Some(ConversationKind::Response), Some(id)) => Ok(Frame::Response { message, id }),
            (Some(kind), None) => Err(SerializerError::Malformed(format!(
                "{kind:?} frame for {} has no conversation_id",
                message.type_tag
            ))),
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Plain(Message),
    Request { message: Message, id: ConversationId },
    Response { message: Message, id: ConversationId },
}

impl Frame {
    pub fn message(&self) -> &Message {
        match self {
            Frame::Plain(message)
            | Frame::Request { message, .. }
            | Frame::Response { message, .. } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PlayerCount {
        server: String,
        online: u32,
    }

    #[test]
    fn test_message_from_payload() {
        let payload = PlayerCount {
            server: "lobby-1".into(),
            online: 42,
        };
        let message = Message::from_payload(&payload).unwrap();

        assert!(message.is::<PlayerCount>());
        assert!(message.type_tag().ends_with("PlayerCount"));
        assert_eq!(message.decode::<PlayerCount>().unwrap(), payload);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let message = Message::new("game::Ping", "{}");
        let plain = serde_json::to_value(Envelope::plain(&message)).unwrap();
        assert_eq!(plain, serde_json::json!({ "type": "game::Ping", "body": "{}" }));

        let id = ConversationId::new();
        let request = serde_json::to_value(Envelope::conversation(
            &message,
            id,
            ConversationKind::Request,
        ))
        .unwrap();
        assert_eq!(request["kind"], "REQUEST");
        assert_eq!(request["conversation_id"], id.to_string());
    }

    #[test]
    fn test_classify() {
        let message = Message::new("game::Ping", "{}");
        let id = ConversationId::new();

        let frame = Envelope::plain(&message).classify().unwrap();
        assert_eq!(frame, Frame::Plain(message.clone()));

        let frame = Envelope::conversation(&message, id, ConversationKind::Response)
            .classify()
            .unwrap();
        assert_eq!(frame, Frame::Response { message: message.clone(), id });

        let mut envelope = Envelope::conversation(&message, id, ConversationKind::Request);
        envelope.conversation_id = None;
        assert!(matches!(envelope.classify(), Err(SerializerError::Malformed(_))));
    }

    #[test]
    fn test_id_without_kind_is_plain() {
        let envelope = Envelope {
            type_tag: "game::Ping".into(),
            body: "{}".into(),
            conversation_id: Some(ConversationId::new()),
            kind: None,
        };
        assert!(matches!(envelope.classify(), Ok(Frame::Plain(_))));
    }

    #[test]
    fn test_response_conversation() {
        let id = ConversationId::new();
        let conversation = Conversation::response(Message::new("a", "1"), id);
        assert_eq!(conversation.kind(), ConversationKind::Response);
        assert_eq!(conversation.id(), id);

        let (_, _, callback) = conversation.into_parts();
        assert!(callback.is_none());
    }
}
