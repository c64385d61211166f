//! Inbound frame classification and dispatch.
//!
//! Every frame the subscriber loop reads ends up here. Decode failures are
//! logged and dropped. A registry miss is expected on a shared channel and
//! only logged at debug level. Responses go to the conversation table.
//! A panicking interceptor or callback is reported as a failure and never
//! unwinds into the subscriber loop.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::conversation::ConversationTable;
use crate::error::InterceptorError;
use crate::interceptor::InterceptorRegistry;
use crate::message::{ConversationId, Frame};
use crate::serializer::Serializer;
use crate::stats::{bump, StatsCounters};
use crate::subscriber::FrameSink;

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A plain message or request reached its interceptor
    Delivered,
    /// A response resolved a pending conversation
    Resolved(ConversationId),
    /// A response for a conversation that is not pending here
    Unmatched(ConversationId),
    /// Nothing is registered for this type tag on this process
    Unhandled(String),
    /// The interceptor ran and returned an error
    Failed(String),
    /// The frame did not decode or its type is not allowed
    Invalid,
}

pub(crate) struct FrameRouter {
    serializer: Arc<dyn Serializer>,
    registry: Arc<InterceptorRegistry>,
    table: Arc<ConversationTable>,
    stats: Arc<StatsCounters>,
}

impl FrameRouter {
    pub(crate) fn new(
        serializer: Arc<dyn Serializer>,
        registry: Arc<InterceptorRegistry>,
        table: Arc<ConversationTable>,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            serializer,
            registry,
            table,
            stats,
        }
    }

    pub(crate) async fn route(&self, raw: &str) -> FrameOutcome {
        bump(&self.stats.frames_received);

        let frame = match self.serializer.decode(raw) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, frame = raw, "⚠️ Dropping invalid frame");
                bump(&self.stats.frames_dropped);
                return FrameOutcome::Invalid;
            }
        };

        match frame {
            Frame::Plain(message) => {
                let result = AssertUnwindSafe(self.registry.dispatch(&message))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panicked(panic)));
                self.settle(message.type_tag(), result)
            }
            Frame::Request { message, id } => {
                let result = AssertUnwindSafe(self.registry.dispatch_conversation(&message, id))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panicked(panic)));
                self.settle(message.type_tag(), result)
            }
            Frame::Response { message, id } => {
                // Counted before the callback runs so a woken requester sees it.
                match self.table.take(&id) {
                    Some(callback) => {
                        bump(&self.stats.conversations_resolved);
                        trace!(conversation_id = %id, "Conversation resolved");
                        match panic::catch_unwind(AssertUnwindSafe(|| callback.on_success(message))) {
                            Ok(()) => FrameOutcome::Resolved(id),
                            Err(panic) => {
                                let error = panicked(panic);
                                warn!(conversation_id = %id, %error, "❌ Conversation callback failed");
                                bump(&self.stats.handler_failures);
                                FrameOutcome::Failed(error.to_string())
                            }
                        }
                    }
                    None => {
                        bump(&self.stats.frames_unhandled);
                        FrameOutcome::Unmatched(id)
                    }
                }
            }
        }
    }

    fn settle(&self, type_tag: &str, result: Result<(), InterceptorError>) -> FrameOutcome {
        match result {
            Ok(()) => FrameOutcome::Delivered,
            Err(error) if error.is_missing() => {
                // Shared channel: other processes' traffic lands here too.
                debug!(type_tag, "No interceptor registered, ignoring frame");
                bump(&self.stats.frames_unhandled);
                FrameOutcome::Unhandled(type_tag.to_string())
            }
            Err(error) => {
                warn!(type_tag, %error, "❌ Interceptor failed");
                bump(&self.stats.handler_failures);
                FrameOutcome::Failed(error.to_string())
            }
        }
    }
}

/// Turns a caught panic payload into a handler error.
pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> InterceptorError {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    InterceptorError::Handler(format!("panicked: {reason}"))
}

#[async_trait]
impl FrameSink for FrameRouter {
    async fn on_frame(&self, raw: &str) -> FrameOutcome {
        self.route(raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::FnCallback;
    use crate::message::{ConversationKind, Envelope, Message, Payload};
    use crate::serializer::{AllowList, JsonSerializer};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct Heartbeat {
        node: String,
    }

    struct Fixture {
        router: FrameRouter,
        registry: Arc<InterceptorRegistry>,
        table: Arc<ConversationTable>,
        stats: Arc<StatsCounters>,
        serializer: JsonSerializer,
    }

    fn fixture() -> Fixture {
        let serializer = JsonSerializer::new(AllowList::new().allow::<Heartbeat>());
        let registry = Arc::new(InterceptorRegistry::new());
        let table = Arc::new(ConversationTable::new());
        let stats = Arc::new(StatsCounters::default());
        Fixture {
            router: FrameRouter::new(
                Arc::new(serializer.clone()),
                registry.clone(),
                table.clone(),
                stats.clone(),
            ),
            registry,
            table,
            stats,
            serializer,
        }
    }

    fn heartbeat() -> Message {
        Message::from_payload(&Heartbeat { node: "n1".into() }).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_frames_are_dropped() {
        let f = fixture();
        assert_eq!(f.router.route("}{").await, FrameOutcome::Invalid);
        assert_eq!(
            f.router
                .route(r#"{"type":"std::process::Command","body":"{}"}"#)
                .await,
            FrameOutcome::Invalid
        );
        assert_eq!(f.stats.frames_dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_plain_without_interceptor_is_unhandled() {
        let f = fixture();
        let raw = f.serializer.encode(&Envelope::plain(&heartbeat())).unwrap();
        assert_eq!(
            f.router.route(&raw).await,
            FrameOutcome::Unhandled(Heartbeat::type_tag().to_string())
        );

        f.registry.register(|beat: Heartbeat| {
            assert_eq!(beat.node, "n1");
            Ok(())
        });
        assert_eq!(f.router.route(&raw).await, FrameOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_failing_interceptor() {
        let f = fixture();
        f.registry
            .register(|_: Heartbeat| Err(InterceptorError::Handler("stale".into())));
        let raw = f.serializer.encode(&Envelope::plain(&heartbeat())).unwrap();

        assert!(matches!(f.router.route(&raw).await, FrameOutcome::Failed(_)));
        assert_eq!(f.stats.handler_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_response_resolves_pending_once() {
        let f = fixture();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let id = ConversationId::new();
        f.table
            .insert(
                id,
                Box::new(FnCallback::new(
                    Duration::from_secs(5),
                    move |reply: Message| {
                        assert!(reply.is::<Heartbeat>());
                        flag.store(true, Ordering::SeqCst);
                    },
                    || {},
                )),
            )
            .unwrap();

        let raw = f
            .serializer
            .encode(&Envelope::conversation(
                &heartbeat(),
                id,
                ConversationKind::Response,
            ))
            .unwrap();
        assert_eq!(f.router.route(&raw).await, FrameOutcome::Resolved(id));
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(f.router.route(&raw).await, FrameOutcome::Unmatched(id));
    }

    #[tokio::test]
    async fn test_panicking_interceptor_is_contained() {
        let f = fixture();
        f.registry.register(|beat: Heartbeat| {
            if beat.node == "n1" {
                panic!("bad heartbeat");
            }
            Ok(())
        });
        let raw = f.serializer.encode(&Envelope::plain(&heartbeat())).unwrap();

        match f.router.route(&raw).await {
            FrameOutcome::Failed(reason) => assert!(reason.contains("bad heartbeat")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(f.stats.handler_failures.load(Ordering::Relaxed), 1);

        let next = Message::from_payload(&Heartbeat { node: "n2".into() }).unwrap();
        let raw = f.serializer.encode(&Envelope::plain(&next)).unwrap();
        assert_eq!(f.router.route(&raw).await, FrameOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let f = fixture();
        let id = ConversationId::new();
        f.table
            .insert(
                id,
                Box::new(FnCallback::new(
                    Duration::from_secs(5),
                    |_: Message| panic!("callback blew up"),
                    || {},
                )),
            )
            .unwrap();

        let raw = f
            .serializer
            .encode(&Envelope::conversation(
                &heartbeat(),
                id,
                ConversationKind::Response,
            ))
            .unwrap();
        assert!(matches!(f.router.route(&raw).await, FrameOutcome::Failed(_)));
        assert!(!f.table.contains(&id));
        assert_eq!(f.stats.handler_failures.load(Ordering::Relaxed), 1);
    }
}
