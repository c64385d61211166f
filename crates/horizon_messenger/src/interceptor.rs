//! Interceptor registry.
//!
//! Maps a payload type tag to exactly one handler. Plain interceptors take a
//! message; conversation interceptors also get the conversation id so they
//! can answer with `send_response`. Registration is last-write-wins and is
//! not ordered against dispatches already in flight.

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

use crate::error::InterceptorError;
use crate::message::{ConversationId, Message, Payload};

/// Handles plain messages of one type.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, message: &Message) -> Result<(), InterceptorError>;
}

/// Handles conversation requests of one type.
#[async_trait]
pub trait ConversationInterceptor: Send + Sync {
    async fn intercept(
        &self,
        message: &Message,
        conversation_id: ConversationId,
    ) -> Result<(), InterceptorError>;
}

fn decode<T: Payload>(message: &Message) -> Result<T, InterceptorError> {
    message.decode().map_err(|source| InterceptorError::Decode {
        type_tag: message.type_tag().to_string(),
        source,
    })
}

/// Adapts a synchronous closure over a decoded payload into an [`Interceptor`].
pub struct TypedInterceptor<T, F> {
    handler: F,
    _phantom: PhantomData<T>,
}

impl<T, F> TypedInterceptor<T, F>
where
    T: Payload,
    F: Fn(T) -> Result<(), InterceptorError> + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> Interceptor for TypedInterceptor<T, F>
where
    T: Payload,
    F: Fn(T) -> Result<(), InterceptorError> + Send + Sync + 'static,
{
    async fn intercept(&self, message: &Message) -> Result<(), InterceptorError> {
        let payload = decode::<T>(message)?;
        (self.handler)(payload)
    }
}

/// Adapts an async closure over a decoded payload and conversation id into a
/// [`ConversationInterceptor`].
pub struct TypedConversationInterceptor<T, F> {
    handler: F,
    _phantom: PhantomData<T>,
}

impl<T, F, Fut> TypedConversationInterceptor<T, F>
where
    T: Payload,
    F: Fn(T, ConversationId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), InterceptorError>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> ConversationInterceptor for TypedConversationInterceptor<T, F>
where
    T: Payload,
    F: Fn(T, ConversationId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), InterceptorError>> + Send + 'static,
{
    async fn intercept(
        &self,
        message: &Message,
        conversation_id: ConversationId,
    ) -> Result<(), InterceptorError> {
        let payload = decode::<T>(message)?;
        (self.handler)(payload, conversation_id).await
    }
}

#[derive(Clone)]
enum Registration {
    Plain(Arc<dyn Interceptor>),
    Conversation(Arc<dyn ConversationInterceptor>),
}

/// Type tag to handler map owned by one messenger.
#[derive(Default)]
pub struct InterceptorRegistry {
    entries: DashMap<String, Registration>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plain handler for `T`.
    ///
    /// ```rust,ignore
    /// registry.register(|update: ScoreUpdate| {
    ///     info!("{} scored", update.player);
    ///     Ok(())
    /// });
    /// ```
    pub fn register<T, F>(&self, handler: F)
    where
        T: Payload,
        F: Fn(T) -> Result<(), InterceptorError> + Send + Sync + 'static,
    {
        self.register_interceptor(T::type_tag(), Arc::new(TypedInterceptor::new(handler)));
    }

    /// Registers a conversation handler for requests of type `T`.
    ///
    /// The handler usually clones a `Publisher` and answers with
    /// `send_response(reply, conversation_id)`.
    pub fn register_conversation<T, F, Fut>(&self, handler: F)
    where
        T: Payload,
        F: Fn(T, ConversationId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), InterceptorError>> + Send + 'static,
    {
        self.register_conversation_interceptor(
            T::type_tag(),
            Arc::new(TypedConversationInterceptor::new(handler)),
        );
    }

    pub fn register_interceptor(&self, type_tag: impl Into<String>, interceptor: Arc<dyn Interceptor>) {
        self.insert(type_tag.into(), Registration::Plain(interceptor));
    }

    pub fn register_conversation_interceptor(
        &self,
        type_tag: impl Into<String>,
        interceptor: Arc<dyn ConversationInterceptor>,
    ) {
        self.insert(type_tag.into(), Registration::Conversation(interceptor));
    }

    fn insert(&self, type_tag: String, registration: Registration) {
        if self.entries.insert(type_tag.clone(), registration).is_some() {
            debug!(%type_tag, "Replaced existing interceptor");
        }
    }

    pub fn unregister<T: Payload>(&self) -> bool {
        self.unregister_tag(T::type_tag())
    }

    pub fn unregister_tag(&self, type_tag: &str) -> bool {
        self.entries.remove(type_tag).is_some()
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.entries.contains_key(type_tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn registered_tags(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    fn lookup(&self, type_tag: &str) -> Option<Registration> {
        self.entries.get(type_tag).map(|entry| entry.value().clone())
    }

    /// Hands a plain message to its interceptor on the calling task.
    pub async fn dispatch(&self, message: &Message) -> Result<(), InterceptorError> {
        match self.lookup(message.type_tag()) {
            Some(Registration::Plain(interceptor)) => interceptor.intercept(message).await,
            _ => Err(InterceptorError::NoInterceptor(message.type_tag().to_string())),
        }
    }

    /// Hands a conversation request to its conversation interceptor on the calling task.
    pub async fn dispatch_conversation(
        &self,
        message: &Message,
        conversation_id: ConversationId,
    ) -> Result<(), InterceptorError> {
        match self.lookup(message.type_tag()) {
            Some(Registration::Conversation(interceptor)) => {
                interceptor.intercept(message, conversation_id).await
            }
            _ => Err(InterceptorError::NoConversationInterceptor(
                message.type_tag().to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ChatLine {
        from: String,
        text: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct BalanceQuery {
        account: u32,
    }

    #[tokio::test]
    async fn test_dispatch_plain() {
        let registry = InterceptorRegistry::new();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        registry.register(move |line: ChatLine| {
            assert_eq!(line.from, "ana");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let message = Message::from_payload(&ChatLine {
            from: "ana".into(),
            text: "gg".into(),
        })
        .unwrap();
        registry.dispatch(&message).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_interceptor() {
        let registry = InterceptorRegistry::new();
        let message = Message::new("game::Unknown", "{}");

        match registry.dispatch(&message).await {
            Err(InterceptorError::NoInterceptor(tag)) => assert_eq!(tag, "game::Unknown"),
            other => panic!("expected NoInterceptor, got {other:?}"),
        }
        assert!(matches!(
            registry.dispatch_conversation(&message, ConversationId::new()).await,
            Err(InterceptorError::NoConversationInterceptor(_))
        ));
    }

    #[tokio::test]
    async fn test_capability_mismatch() {
        let registry = InterceptorRegistry::new();
        registry.register_conversation(|_: BalanceQuery, _id| async { Ok::<(), InterceptorError>(()) });
        registry.register(|_: ChatLine| Ok(()));

        let query = Message::from_payload(&BalanceQuery { account: 1 }).unwrap();
        assert!(matches!(
            registry.dispatch(&query).await,
            Err(InterceptorError::NoInterceptor(_))
        ));

        let chat = Message::from_payload(&ChatLine {
            from: "a".into(),
            text: "b".into(),
        })
        .unwrap();
        assert!(matches!(
            registry.dispatch_conversation(&chat, ConversationId::new()).await,
            Err(InterceptorError::NoConversationInterceptor(_))
        ));
    }

    #[tokio::test]
    async fn test_conversation_handler_gets_id() {
        let registry = InterceptorRegistry::new();
        let expected = ConversationId::new();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        registry.register_conversation(move |query: BalanceQuery, id: ConversationId| {
            let counter = counter.clone();
            async move {
                assert_eq!(id, expected);
                counter.fetch_add(query.account, Ordering::SeqCst);
                Ok::<(), InterceptorError>(())
            }
        });

        let message = Message::from_payload(&BalanceQuery { account: 9 }).unwrap();
        registry.dispatch_conversation(&message, expected).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn test_decode_failure_and_handler_error() {
        let registry = InterceptorRegistry::new();
        registry.register(|_: ChatLine| Err(InterceptorError::Handler("muted".into())));

        let bad_body = Message::new(ChatLine::type_tag(), "{\"from\":1}");
        assert!(matches!(
            registry.dispatch(&bad_body).await,
            Err(InterceptorError::Decode { .. })
        ));

        let good = Message::from_payload(&ChatLine {
            from: "a".into(),
            text: "b".into(),
        })
        .unwrap();
        assert!(matches!(
            registry.dispatch(&good).await,
            Err(InterceptorError::Handler(_))
        ));
    }

    #[test]
    fn test_last_registration_wins_and_unregister() {
        let registry = InterceptorRegistry::new();
        registry.register(|_: ChatLine| Ok(()));
        registry.register(|_: ChatLine| Ok(()));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(ChatLine::type_tag()));

        assert!(registry.unregister::<ChatLine>());
        assert!(!registry.unregister::<ChatLine>());
        assert!(registry.is_empty());
    }
}
