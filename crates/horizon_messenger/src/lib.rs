//! # Horizon Messenger
//!
//! Cross-process messaging for Horizon server plugins. Every process that
//! shares a broker channel can publish fire-and-forget messages and run
//! request/response conversations with the others.
//!
//! ## Pieces
//!
//! - [`Messenger`] owns the background subscriber loop, which reconnects with
//!   a fixed backoff, and routes every inbound frame.
//! - [`Publisher`] is the cloneable sending half.
//! - [`InterceptorRegistry`] maps payload types to handlers.
//! - [`ConversationTable`] holds pending requests; a response and a timeout
//!   race through one atomic `take`, so each request resolves exactly once.
//! - [`Serializer`], [`BrokerPool`] and [`TaskScheduler`] are the seams to
//!   encoding, the broker and the runtime.
//!
//! ## Delivery
//!
//! All processes see every publish on the channel. A frame whose type has no
//! interceptor here is simply not for this process. Nothing is persisted while
//! disconnected and there is no ordering across channels.
//!
//! Interceptors run inline on the subscriber loop task, so a slow interceptor
//! delays every frame behind it. Offload heavy work.

pub mod broker;
pub mod callback;
pub mod config;
pub mod conversation;
pub mod error;
pub mod interceptor;
pub mod message;
pub mod messenger;
pub mod router;
pub mod scheduler;
pub mod serializer;
pub mod stats;
pub mod subscriber;

pub use broker::{BrokerConnection, BrokerPool, MemoryBroker, Subscription, WebSocketBroker};
pub use callback::{ConversationCallback, FnCallback};
pub use config::{BrokerSettings, MessengerConfig};
pub use conversation::ConversationTable;
pub use error::{BrokerError, ConfigError, InterceptorError, MessengerError, SerializerError};
pub use interceptor::{
    ConversationInterceptor, Interceptor, InterceptorRegistry, TypedConversationInterceptor,
    TypedInterceptor,
};
pub use message::{Conversation, ConversationId, ConversationKind, Envelope, Frame, Message, Payload};
pub use messenger::{Messenger, MessengerBuilder, Publisher};
pub use router::FrameOutcome;
pub use scheduler::{TaskScheduler, TokioScheduler};
pub use serializer::{AllowList, JsonSerializer, Serializer};
pub use stats::MessengerStats;
pub use subscriber::LoopState;
