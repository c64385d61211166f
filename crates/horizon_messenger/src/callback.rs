//! Resolution side of a conversation.
//!
//! Both resolution methods consume the boxed callback, so once the
//! conversation table hands it out it cannot fire again.

use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::message::Message;

/// Receives the outcome of a request conversation.
///
/// Invoked on an unspecified worker context: either the subscriber loop task
/// (`on_success`) or a scheduler task (`on_timeout`). Implementations must not
/// assume thread affinity and should return quickly, since `on_success` runs
/// inline with frame dispatch.
pub trait ConversationCallback: Send + Sync + 'static {
    /// A response with the matching id arrived first.
    fn on_success(self: Box<Self>, reply: Message);

    /// The timeout elapsed first.
    fn on_timeout(self: Box<Self>);

    /// How long to wait for a response.
    fn timeout(&self) -> Duration;
}

/// Closure-backed callback.
///
/// ```rust,ignore
/// let callback = FnCallback::new(
///     Duration::from_secs(2),
///     |reply| info!("got {}", reply.body()),
///     || warn!("no answer"),
/// );
/// publisher.send_request(message, Box::new(callback)).await?;
/// ```
pub struct FnCallback<S, T> {
    timeout: Duration,
    on_success: S,
    on_timeout: T,
}

impl<S, T> FnCallback<S, T>
where
    S: FnOnce(Message) + Send + Sync + 'static,
    T: FnOnce() + Send + Sync + 'static,
{
    pub fn new(timeout: Duration, on_success: S, on_timeout: T) -> Self {
        Self {
            timeout,
            on_success,
            on_timeout,
        }
    }
}

impl<S, T> ConversationCallback for FnCallback<S, T>
where
    S: FnOnce(Message) + Send + Sync + 'static,
    T: FnOnce() + Send + Sync + 'static,
{
    fn on_success(self: Box<Self>, reply: Message) {
        (self.on_success)(reply)
    }

    fn on_timeout(self: Box<Self>) {
        (self.on_timeout)()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<S, T> fmt::Debug for FnCallback<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCallback")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Forwards the outcome into a oneshot channel.
///
/// `Some(reply)` on success, `None` on timeout. Dropping it unresolved closes
/// the channel, which the awaiting side reads as cancellation.
#[derive(Debug)]
pub(crate) struct ReplySender {
    tx: oneshot::Sender<Option<Message>>,
    timeout: Duration,
}

impl ReplySender {
    pub(crate) fn new(timeout: Duration) -> (Self, oneshot::Receiver<Option<Message>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx, timeout }, rx)
    }
}

impl ConversationCallback for ReplySender {
    fn on_success(self: Box<Self>, reply: Message) {
        // The requester may have stopped waiting.
        let _ = self.tx.send(Some(reply));
    }

    fn on_timeout(self: Box<Self>) {
        let _ = self.tx.send(None);
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fn_callback_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let callback: Box<dyn ConversationCallback> = Box::new(FnCallback::new(
            Duration::from_millis(250),
            move |reply: Message| {
                assert_eq!(reply.body(), "7");
                seen.fetch_add(1, Ordering::SeqCst);
            },
            || panic!("timeout must not fire"),
        ));

        assert_eq!(callback.timeout(), Duration::from_millis(250));
        callback.on_success(Message::new("n", "7"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reply_sender() {
        let (sender, rx) = ReplySender::new(Duration::from_secs(1));
        Box::new(sender).on_success(Message::new("n", "1"));
        assert_eq!(rx.await.unwrap(), Some(Message::new("n", "1")));

        let (sender, rx) = ReplySender::new(Duration::from_secs(1));
        Box::new(sender).on_timeout();
        assert_eq!(rx.await.unwrap(), None);

        let (sender, rx) = ReplySender::new(Duration::from_secs(1));
        drop(sender);
        assert!(rx.await.is_err());
    }
}
