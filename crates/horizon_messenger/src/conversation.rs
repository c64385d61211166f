//! Pending request conversations.
//!
//! Every entry is removed exactly once, by [`ConversationTable::take`]. The
//! response path and the timeout path both go through it, so whichever runs
//! first owns the callback and the other finds nothing.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::callback::ConversationCallback;
use crate::error::MessengerError;
use crate::message::{ConversationId, Message};

#[derive(Default)]
pub struct ConversationTable {
    pending: DashMap<ConversationId, Box<dyn ConversationCallback>>,
}

impl ConversationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. An id can only be pending once.
    pub fn insert(
        &self,
        id: ConversationId,
        callback: Box<dyn ConversationCallback>,
    ) -> Result<(), MessengerError> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(MessengerError::DuplicateConversation(id)),
            Entry::Vacant(slot) => {
                slot.insert(callback);
                Ok(())
            }
        }
    }

    /// Atomically removes and returns the callback for `id`.
    pub fn take(&self, id: &ConversationId) -> Option<Box<dyn ConversationCallback>> {
        self.pending.remove(id).map(|(_, callback)| callback)
    }

    /// Takes the callback and fires `on_success`. Returns whether one was pending.
    ///
    /// The callback runs after the shard lock is released.
    pub fn resolve(&self, id: &ConversationId, reply: Message) -> bool {
        match self.take(id) {
            Some(callback) => {
                callback.on_success(reply);
                true
            }
            None => false,
        }
    }

    /// Takes the callback and fires `on_timeout`. Returns whether one was pending.
    pub fn expire(&self, id: &ConversationId) -> bool {
        match self.take(id) {
            Some(callback) => {
                callback.on_timeout();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
