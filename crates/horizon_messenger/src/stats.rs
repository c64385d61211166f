use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a messenger's counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MessengerStats {
    /// Frames read off the channel
    pub frames_received: u64,
    /// Frames that failed to decode or were not on the allow-list
    pub frames_dropped: u64,
    /// Frames with no matching interceptor or pending conversation
    pub frames_unhandled: u64,
    /// Interceptors that returned an error
    pub handler_failures: u64,
    /// Successful publishes
    pub messages_sent: u64,
    pub conversations_started: u64,
    pub conversations_resolved: u64,
    pub conversations_timed_out: u64,
    /// Subscriptions re-established after a loss
    pub reconnects: u64,
    /// Requests still waiting for a response or timeout
    pub pending_conversations: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) frames_received: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) frames_unhandled: AtomicU64,
    pub(crate) handler_failures: AtomicU64,
    pub(crate) messages_sent: AtomicU64,
    pub(crate) conversations_started: AtomicU64,
    pub(crate) conversations_resolved: AtomicU64,
    pub(crate) conversations_timed_out: AtomicU64,
    pub(crate) reconnects: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StatsCounters {
    pub(crate) fn snapshot(&self, pending_conversations: usize) -> MessengerStats {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MessengerStats {
            frames_received: read(&self.frames_received),
            frames_dropped: read(&self.frames_dropped),
            frames_unhandled: read(&self.frames_unhandled),
            handler_failures: read(&self.handler_failures),
            messages_sent: read(&self.messages_sent),
            conversations_started: read(&self.conversations_started),
            conversations_resolved: read(&self.conversations_resolved),
            conversations_timed_out: read(&self.conversations_timed_out),
            reconnects: read(&self.reconnects),
            pending_conversations,
        }
    }
}
