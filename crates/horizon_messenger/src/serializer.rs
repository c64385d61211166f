//! Envelope encoding and the payload allow-list.
//!
//! The allow-list is checked on the raw envelope tag, before any body is
//! decoded into a concrete type, so a disallowed payload is never
//! instantiated.

use std::collections::HashSet;
use tracing::trace;

use crate::error::SerializerError;
use crate::message::{Envelope, Frame, Payload};

/// Turns envelopes into wire strings and wire strings into classified frames.
pub trait Serializer: Send + Sync + 'static {
    fn encode(&self, envelope: &Envelope) -> Result<String, SerializerError>;

    /// Decodes and classifies a frame, rejecting payload types that are not allowed.
    fn decode(&self, raw: &str) -> Result<Frame, SerializerError>;
}

/// The set of payload type tags this process accepts from the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    tags: HashSet<String>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow<T: Payload>(mut self) -> Self {
        self.tags.insert(T::type_tag().to_string());
        self
    }

    pub fn allow_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for AllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            tags: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// JSON envelope codec.
///
/// Outbound frames are not filtered; only what is read off the channel has to
/// pass the allow-list.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer {
    allow_list: AllowList,
}

impl JsonSerializer {
    pub fn new(allow_list: AllowList) -> Self {
        Self { allow_list }
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }
}

impl Serializer for JsonSerializer {
    fn encode(&self, envelope: &Envelope) -> Result<String, SerializerError> {
        Ok(serde_json::to_string(envelope)?)
    }

    fn decode(&self, raw: &str) -> Result<Frame, SerializerError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        if !self.allow_list.contains(&envelope.type_tag) {
            trace!(type_tag = %envelope.type_tag, "Rejected by allow-list");
            return Err(SerializerError::Disallowed(envelope.type_tag));
        }
        envelope.classify()
    }
}
