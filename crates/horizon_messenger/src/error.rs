//! Error types for the messaging core.
//!
//! Each collaborator reports its own error enum; [`MessengerError`] wraps the
//! ones that can surface to callers of the `send*` family.

use std::time::Duration;
use thiserror::Error;

use crate::message::ConversationId;

/// Failures reported by a broker pool, connection or subscription.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Every pooled connection stayed checked out for the whole acquire window
    #[error("Connection pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),
    /// The broker could not be reached at all
    #[error("Broker unreachable: {0}")]
    Unreachable(String),
    /// An established connection or subscription dropped
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    /// The broker answered with something we did not expect
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The broker refused the operation (bad credentials, denied publish)
    #[error("Broker rejected request: {0}")]
    Rejected(String),
}

/// Failures while encoding or decoding a wire frame.
#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame names a payload type that is not on the allow-list
    #[error("Payload type is not allowed: {0}")]
    Disallowed(String),
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Failures raised by the interceptor registry or by an interceptor itself.
#[derive(Debug, Error)]
pub enum InterceptorError {
    #[error("No interceptor found for type {0}")]
    NoInterceptor(String),
    #[error("No conversation interceptor found for type {0}")]
    NoConversationInterceptor(String),
    /// The body did not decode into the type the interceptor was registered for
    #[error("Failed to decode {type_tag}: {source}")]
    Decode {
        type_tag: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Interceptor failed: {0}")]
    Handler(String),
}

impl InterceptorError {
    /// Whether this error means nothing was registered for the frame.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            Self::NoInterceptor(_) | Self::NoConversationInterceptor(_)
        )
    }
}

/// Errors returned to callers of the messenger.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// `disconnect()` has been called
    #[error("Messenger is closed")]
    Closed,
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Serializer(#[from] SerializerError),
    #[error("Conversation {0} timed out")]
    Timeout(ConversationId),
    /// The callback was dropped without being resolved
    #[error("Conversation {0} was dropped before it resolved")]
    Cancelled(ConversationId),
    #[error("Conversation {0} is already pending")]
    DuplicateConversation(ConversationId),
}

// Lets interceptors use `?` on sends and payload encoding.
impl From<MessengerError> for InterceptorError {
    fn from(error: MessengerError) -> Self {
        InterceptorError::Handler(error.to_string())
    }
}

impl From<SerializerError> for InterceptorError {
    fn from(error: SerializerError) -> Self {
        InterceptorError::Handler(error.to_string())
    }
}

/// Errors while loading messenger configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to write TOML: {0}")]
    Write(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
