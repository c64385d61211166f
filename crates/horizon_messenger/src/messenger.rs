//! The messenger: publishing, conversations and the subscriber loop lifecycle.
//!
//! [`Messenger`] owns the interceptor registry and starts/stops the
//! background loop. Sending lives on [`Publisher`], a cheap clone that
//! interceptors capture to reply to requests without holding the messenger
//! itself.
//!
//! # Example
//!
//! ```rust,ignore
//! let messenger = Messenger::builder(Arc::new(MemoryBroker::default()))
//!     .allow::<PriceQuery>()
//!     .allow::<PriceQuote>()
//!     .build();
//!
//! let publisher = messenger.publisher();
//! messenger.registry().register_conversation(move |query: PriceQuery, id| {
//!     let publisher = publisher.clone();
//!     async move {
//!         let quote = Message::from_payload(&PriceQuote { item: query.item, price: 12 })?;
//!         publisher.send_response(quote, id).await?;
//!         Ok(())
//!     }
//! });
//!
//! messenger.connect();
//! let quote: PriceQuote = messenger.request(&PriceQuery { item: "sword".into() }).await?;
//! messenger.disconnect().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::broker::BrokerPool;
use crate::callback::{ConversationCallback, ReplySender};
use crate::config::MessengerConfig;
use crate::conversation::ConversationTable;
use crate::error::{ConfigError, MessengerError};
use crate::interceptor::InterceptorRegistry;
use crate::message::{Conversation, ConversationId, Envelope, Message, Payload};
use crate::router::{FrameOutcome, FrameRouter};
use crate::scheduler::{TaskScheduler, TokioScheduler};
use crate::serializer::{AllowList, JsonSerializer, Serializer};
use crate::stats::{bump, MessengerStats, StatsCounters};
use crate::subscriber::{LoopState, SubscriberLoop};

/// Removes a freshly inserted conversation unless [`keep`](Self::keep) is called.
struct PendingEntry<'a> {
    table: &'a ConversationTable,
    id: ConversationId,
    armed: bool,
}

impl<'a> PendingEntry<'a> {
    fn new(table: &'a ConversationTable, id: ConversationId) -> Self {
        Self {
            table,
            id,
            armed: true,
        }
    }

    fn keep(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if self.armed && self.table.take(&self.id).is_some() {
            debug!(conversation_id = %self.id, "Dropped conversation that was never published");
        }
    }
}

struct Shared {
    pool: Arc<dyn BrokerPool>,
    serializer: Arc<dyn Serializer>,
    scheduler: Arc<dyn TaskScheduler>,
    table: Arc<ConversationTable>,
    stats: Arc<StatsCounters>,
    channel: String,
    default_timeout: Duration,
    closed: AtomicBool,
}

/// Sending half of a messenger.
///
/// All methods are safe to call concurrently from any task. Each publish
/// checks out one pooled connection and releases it on return, error or not.
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<Shared>,
}

impl Publisher {
    fn ensure_open(&self) -> Result<(), MessengerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(MessengerError::Closed)
        } else {
            Ok(())
        }
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), MessengerError> {
        self.ensure_open()?;
        let raw = self.shared.serializer.encode(envelope)?;
        let mut connection = self.shared.pool.acquire().await?;
        connection.publish(&self.shared.channel, &raw).await?;
        bump(&self.shared.stats.messages_sent);
        trace!(type_tag = %envelope.type_tag, channel = %self.shared.channel, "Published frame");
        Ok(())
    }

    /// Publishes a plain message. Fire-and-forget.
    pub async fn send(&self, message: &Message) -> Result<(), MessengerError> {
        self.publish(&Envelope::plain(message)).await
    }

    /// Serializes `payload` and publishes it as a plain message.
    pub async fn send_payload<T: Payload>(&self, payload: &T) -> Result<(), MessengerError> {
        self.send(&Message::from_payload(payload)?).await
    }

    /// Starts a request conversation and returns its id without waiting.
    ///
    /// The callback is resolved exactly once, by the matching response or by
    /// its timeout, on an unspecified task. If the publish fails the callback
    /// is dropped unresolved and the error is returned. The same happens when
    /// the returned future is dropped before the publish completes.
    pub async fn send_request(
        &self,
        message: Message,
        callback: Box<dyn ConversationCallback>,
    ) -> Result<ConversationId, MessengerError> {
        self.send_conversation(Conversation::request(message, callback))
            .await
    }

    /// Answers the request conversation `id`.
    pub async fn send_response(
        &self,
        message: Message,
        id: ConversationId,
    ) -> Result<(), MessengerError> {
        self.send_conversation(Conversation::response(message, id))
            .await
            .map(|_| ())
    }

    /// Publishes a conversation of either kind.
    pub async fn send_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<ConversationId, MessengerError> {
        self.ensure_open()?;
        let kind = conversation.kind();
        let (message, id, callback) = conversation.into_parts();
        let envelope = Envelope::conversation(&message, id, kind);

        let Some(callback) = callback else {
            self.publish(&envelope).await?;
            return Ok(id);
        };

        let timeout = callback.timeout();
        self.shared.table.insert(id, callback)?;
        // Released on a publish error and when this future is dropped mid-publish.
        let mut pending = PendingEntry::new(&self.shared.table, id);
        self.publish(&envelope).await?;
        pending.keep();
        bump(&self.shared.stats.conversations_started);
        debug!(conversation_id = %id, type_tag = message.type_tag(), "Started conversation");

        let table = self.shared.table.clone();
        let stats = self.shared.stats.clone();
        self.shared.scheduler.run_after(
            timeout,
            Box::new(move || {
                if let Some(callback) = table.take(&id) {
                    bump(&stats.conversations_timed_out);
                    debug!(conversation_id = %id, "Conversation timed out");
                    callback.on_timeout();
                }
            }),
        );
        Ok(id)
    }

    /// Sends a request and waits for the typed reply, using the default timeout.
    pub async fn request<Req: Payload, Res: Payload>(
        &self,
        payload: &Req,
    ) -> Result<Res, MessengerError> {
        self.request_with_timeout(payload, self.shared.default_timeout)
            .await
    }

    pub async fn request_with_timeout<Req: Payload, Res: Payload>(
        &self,
        payload: &Req,
        timeout: Duration,
    ) -> Result<Res, MessengerError> {
        let message = Message::from_payload(payload)?;
        let (callback, reply) = ReplySender::new(timeout);
        let id = self.send_request(message, Box::new(callback)).await?;

        match reply.await {
            Ok(Some(reply)) => reply
                .decode::<Res>()
                .map_err(|e| MessengerError::Serializer(e.into())),
            Ok(None) => Err(MessengerError::Timeout(id)),
            Err(_) => Err(MessengerError::Cancelled(id)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Builds a [`Messenger`], with defaults for each collaborator.
pub struct MessengerBuilder {
    pool: Arc<dyn BrokerPool>,
    serializer: Option<Arc<dyn Serializer>>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    allow_list: AllowList,
    channel: String,
    backoff: Duration,
    default_timeout: Duration,
}

impl MessengerBuilder {
    fn new(pool: Arc<dyn BrokerPool>) -> Self {
        let defaults = MessengerConfig::default();
        Self {
            pool,
            serializer: None,
            scheduler: None,
            allow_list: AllowList::new(),
            channel: defaults.channel.clone(),
            backoff: defaults.reconnect_backoff(),
            default_timeout: defaults.request_timeout(),
        }
    }

    /// Takes channel, backoff, timeout and allow-list from `config`.
    pub fn config(mut self, config: &MessengerConfig) -> Self {
        self.channel = config.channel.clone();
        self.backoff = config.reconnect_backoff();
        self.default_timeout = config.request_timeout();
        self.allow_list = config.allow_list();
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Accepts `T` from the channel. Ignored when a custom serializer is set.
    pub fn allow<T: Payload>(mut self) -> Self {
        self.allow_list = self.allow_list.allow::<T>();
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> Messenger {
        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(JsonSerializer::new(self.allow_list)));
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()));
        let table = Arc::new(ConversationTable::new());
        let stats = Arc::new(StatsCounters::default());
        let registry = Arc::new(InterceptorRegistry::new());

        let router = Arc::new(FrameRouter::new(
            serializer.clone(),
            registry.clone(),
            table.clone(),
            stats.clone(),
        ));
        let shared = Arc::new(Shared {
            pool: self.pool,
            serializer,
            scheduler,
            table,
            stats,
            channel: self.channel,
            default_timeout: self.default_timeout,
            closed: AtomicBool::new(false),
        });

        Messenger {
            publisher: Publisher { shared },
            registry,
            router,
            backoff: self.backoff,
            started: AtomicBool::new(false),
            state: Arc::new(watch::channel(LoopState::Idle).0),
            shutdown: watch::channel(false).0,
        }
    }
}

/// Broker-backed messenger for one process.
pub struct Messenger {
    publisher: Publisher,
    registry: Arc<InterceptorRegistry>,
    router: Arc<FrameRouter>,
    backoff: Duration,
    started: AtomicBool,
    state: Arc<watch::Sender<LoopState>>,
    shutdown: watch::Sender<bool>,
}

impl Messenger {
    pub fn builder(pool: Arc<dyn BrokerPool>) -> MessengerBuilder {
        MessengerBuilder::new(pool)
    }

    /// Messenger with JSON encoding and the tokio scheduler, configured from `config`.
    ///
    /// Rejects configs that fail [`MessengerConfig::validate`], such as a zero
    /// reconnect backoff.
    pub fn new(config: &MessengerConfig, pool: Arc<dyn BrokerPool>) -> Result<Self, ConfigError> {
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(Self::builder(pool).config(config).build())
    }

    /// Starts the subscriber loop. Only the first call has an effect.
    ///
    /// Never fails: if the broker is down the loop keeps retrying. Must be
    /// called from within a tokio runtime when the default scheduler is used.
    pub fn connect(&self) {
        if self.publisher.is_closed() {
            warn!("connect() called on a closed messenger");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Messenger already connected");
            return;
        }

        let shared = &self.publisher.shared;
        let subscriber = SubscriberLoop::new(
            shared.pool.clone(),
            shared.channel.clone(),
            self.backoff,
            self.router.clone(),
            self.state.clone(),
            self.shutdown.subscribe(),
            shared.stats.clone(),
        );
        shared.scheduler.run_async(Box::pin(subscriber.run()));
        info!(channel = %shared.channel, "🚀 Messenger connecting");
    }

    /// Stops the loop and closes the messenger.
    ///
    /// Sends after this fail with [`MessengerError::Closed`]. Returns once the
    /// loop has unsubscribed and exited. Pending conversations still resolve
    /// through their timeouts.
    pub async fn disconnect(&self) {
        self.publisher.shared.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        if self.started.load(Ordering::SeqCst) {
            let mut state = self.state.subscribe();
            let _ = state.wait_for(|state| *state == LoopState::Closed).await;
        } else {
            self.state.send_replace(LoopState::Closed);
        }

        self.registry.clear();
        info!(channel = %self.publisher.shared.channel, "👋 Messenger disconnected");
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn registry(&self) -> &InterceptorRegistry {
        &self.registry
    }

    pub async fn send(&self, message: &Message) -> Result<(), MessengerError> {
        self.publisher.send(message).await
    }

    pub async fn send_payload<T: Payload>(&self, payload: &T) -> Result<(), MessengerError> {
        self.publisher.send_payload(payload).await
    }

    pub async fn send_request(
        &self,
        message: Message,
        callback: Box<dyn ConversationCallback>,
    ) -> Result<ConversationId, MessengerError> {
        self.publisher.send_request(message, callback).await
    }

    pub async fn send_response(
        &self,
        message: Message,
        id: ConversationId,
    ) -> Result<(), MessengerError> {
        self.publisher.send_response(message, id).await
    }

    pub async fn send_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<ConversationId, MessengerError> {
        self.publisher.send_conversation(conversation).await
    }

    pub async fn request<Req: Payload, Res: Payload>(
        &self,
        payload: &Req,
    ) -> Result<Res, MessengerError> {
        self.publisher.request(payload).await
    }

    pub async fn request_with_timeout<Req: Payload, Res: Payload>(
        &self,
        payload: &Req,
        timeout: Duration,
    ) -> Result<Res, MessengerError> {
        self.publisher.request_with_timeout(payload, timeout).await
    }

    /// Classifies and dispatches one raw frame, as the subscriber loop does.
    pub async fn on_frame(&self, raw: &str) -> FrameOutcome {
        self.router.route(raw).await
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn pending_conversations(&self) -> usize {
        self.publisher.shared.table.len()
    }

    pub fn is_pending(&self, id: &ConversationId) -> bool {
        self.publisher.shared.table.contains(id)
    }

    pub fn stats(&self) -> MessengerStats {
        let shared = &self.publisher.shared;
        shared.stats.snapshot(shared.table.len())
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        // Lets a still-running loop exit on its own.
        self.publisher.shared.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::callback::FnCallback;
    use crate::error::BrokerError;
    use crate::broker::{BrokerConnection, BrokerPool};
    use crate::message::ConversationKind;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    fn messenger(broker: &MemoryBroker) -> Messenger {
        Messenger::builder(Arc::new(broker.clone()))
            .channel("unit:messenger")
            .reconnect_backoff(Duration::from_millis(20))
            .allow::<Ping>()
            .build()
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = MemoryBroker::default();
        let messenger = messenger(&broker);
        messenger.connect();
        messenger.connect();

        let mut state = messenger.state_receiver();
        state.wait_for(|s| *s == LoopState::Subscribed).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.subscriber_count("unit:messenger"), 1);

        messenger.disconnect().await;
        assert_eq!(messenger.state(), LoopState::Closed);
        assert_eq!(broker.subscriber_count("unit:messenger"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_without_connect() {
        let broker = MemoryBroker::default();
        let messenger = messenger(&broker);
        messenger.registry().register(|_: Ping| Ok(()));

        messenger.disconnect().await;
        assert_eq!(messenger.state(), LoopState::Closed);
        assert!(messenger.registry().is_empty());
        assert!(matches!(
            messenger.send_payload(&Ping { seq: 1 }).await,
            Err(MessengerError::Closed)
        ));

        messenger.connect();
        assert_eq!(broker.subscriber_count("unit:messenger"), 0);
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_nothing_pending() {
        let broker = MemoryBroker::default();
        let messenger = messenger(&broker);
        broker.set_reachable(false);

        let message = Message::from_payload(&Ping { seq: 1 }).unwrap();
        let callback = FnCallback::new(
            Duration::from_millis(10),
            |_| panic!("no reply expected"),
            || panic!("no timeout expected"),
        );
        let result = messenger.send_request(message, Box::new(callback)).await;

        assert!(matches!(
            result,
            Err(MessengerError::Broker(BrokerError::Unreachable(_)))
        ));
        assert_eq!(messenger.pending_conversations(), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(messenger.stats().conversations_timed_out, 0);
    }

    #[tokio::test]
    async fn test_on_frame_reports_outcome() {
        let broker = MemoryBroker::default();
        let messenger = messenger(&broker);

        assert_eq!(messenger.on_frame("garbage").await, FrameOutcome::Invalid);

        let id = ConversationId::new();
        let raw = serde_json::to_string(&Envelope::conversation(
            &Message::from_payload(&Ping { seq: 3 }).unwrap(),
            id,
            ConversationKind::Response,
        ))
        .unwrap();
        assert_eq!(messenger.on_frame(&raw).await, FrameOutcome::Unmatched(id));

        let stats = messenger.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.frames_unhandled, 1);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let broker = MemoryBroker::default();
        let messenger = messenger(&broker);
        messenger.connect();

        let result: Result<Ping, _> = messenger
            .request_with_timeout(&Ping { seq: 1 }, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(MessengerError::Timeout(_))));
        assert_eq!(messenger.pending_conversations(), 0);
        assert_eq!(messenger.stats().conversations_timed_out, 1);

        messenger.disconnect().await;
    }

    /// Pool whose connections never become available.
    struct StalledPool;

    #[async_trait]
    impl BrokerPool for StalledPool {
        async fn acquire(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancelled_request_leaves_nothing_pending() {
        let messenger = Messenger::builder(Arc::new(StalledPool))
            .channel("unit:messenger")
            .allow::<Ping>()
            .build();

        let message = Message::from_payload(&Ping { seq: 1 }).unwrap();
        let callback = FnCallback::new(
            Duration::from_millis(10),
            |_| panic!("no reply expected"),
            || panic!("no timeout expected"),
        );
        let send = messenger.send_request(message, Box::new(callback));
        assert!(tokio::time::timeout(Duration::from_millis(20), send)
            .await
            .is_err());
        assert_eq!(messenger.pending_conversations(), 0);

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            messenger.request_with_timeout::<Ping, Ping>(&Ping { seq: 2 }, Duration::from_secs(5)),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(messenger.pending_conversations(), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(messenger.stats().conversations_timed_out, 0);
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let broker = MemoryBroker::default();
        let mut config = MessengerConfig::default();
        config.reconnect_backoff_ms = 0;
        assert!(matches!(
            Messenger::new(&config, Arc::new(broker.clone())),
            Err(ConfigError::Invalid(_))
        ));

        config.reconnect_backoff_ms = 250;
        let messenger = Messenger::new(&config, Arc::new(broker)).unwrap();
        assert_eq!(messenger.state(), LoopState::Idle);
    }
}
