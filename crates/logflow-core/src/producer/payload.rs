//! Payload sources for the produce loop.

use bytes::Bytes;
use std::collections::VecDeque;

/// Supplies one payload per message id.
pub trait PayloadSource: Send {
    /// Payload for message `id`, or `None` once the source is exhausted.
    fn next_payload(&mut self, id: u64) -> Option<Bytes>;
}

/// Endless `"{prefix}-{id}"` payloads.
#[derive(Debug, Clone)]
pub struct SequentialPayloads {
    prefix: String,
}

impl SequentialPayloads {
    /// Create a generator with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for SequentialPayloads {
    fn default() -> Self {
        Self::new("message")
    }
}

impl PayloadSource for SequentialPayloads {
    fn next_payload(&mut self, id: u64) -> Option<Bytes> {
        Some(Bytes::from(format!("{}-{}", self.prefix, id)))
    }
}

/// A fixed queue of payloads, drained in order.
#[derive(Debug, Clone, Default)]
pub struct FinitePayloads {
    queue: VecDeque<Bytes>,
}

impl FinitePayloads {
    /// Queue the given payloads.
    pub fn new<I, P>(payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        Self {
            queue: payloads.into_iter().map(Into::into).collect(),
        }
    }

    /// Payloads left.
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl PayloadSource for FinitePayloads {
    fn next_payload(&mut self, _id: u64) -> Option<Bytes> {
        self.queue.pop_front()
    }
}
