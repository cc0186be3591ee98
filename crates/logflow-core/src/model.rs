//! Resource descriptors, messages and polling/partitioning selectors.

use crate::identifier::ResourceIdentifier;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A stream as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Broker-assigned stream id
    pub id: u32,
    /// Stream name
    pub name: String,
}

impl StreamDescriptor {
    /// Numeric identifier of this stream.
    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier::Numeric(self.id)
    }
}

/// A topic as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescriptor {
    /// Broker-assigned topic id, unique within its stream
    pub id: u32,
    /// Topic name
    pub name: String,
    /// Number of partitions (>= 1)
    pub partitions_count: u32,
    /// Replication factor (>= 1)
    pub replication_factor: u8,
}

impl TopicDescriptor {
    /// Numeric identifier of this topic.
    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier::Numeric(self.id)
    }

    /// Whether the 1-based partition id exists on this topic.
    pub fn has_partition(&self, partition_id: u32) -> bool {
        partition_id >= 1 && partition_id <= self.partitions_count
    }
}

/// A message to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Message payload
    pub payload: Bytes,
}

impl OutboundMessage {
    /// Create a message from any byte source.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<&str> for OutboundMessage {
    fn from(value: &str) -> Self {
        Self::new(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for OutboundMessage {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A message returned by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Offset within the partition
    pub offset: u64,
    /// Message payload
    pub payload: Bytes,
    /// Time the broker appended the message
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Get the payload as a string.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Where a poll starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollingStrategy {
    /// Start at an absolute offset
    Offset(u64),
    /// Start after the consumer's last committed position
    #[default]
    Next,
    /// Start at the beginning of the partition
    First,
    /// Read the most recent messages of the partition
    Last,
}

impl PollingStrategy {
    /// Whether resolving this strategy needs the partition's boundary offsets.
    pub fn needs_bounds(&self) -> bool {
        !matches!(self, PollingStrategy::Offset(_))
    }
}

impl fmt::Display for PollingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollingStrategy::Offset(value) => write!(f, "offset({})", value),
            PollingStrategy::Next => f.write_str("next"),
            PollingStrategy::First => f.write_str("first"),
            PollingStrategy::Last => f.write_str("last"),
        }
    }
}

/// How the broker picks the partition for a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Partitioning {
    /// Let the broker spread batches across partitions
    Balanced,
    /// Send to an explicit 1-based partition
    PartitionId(u32),
    /// Hash the key to a partition (same key, same partition)
    MessagesKey(Bytes),
}

impl Partitioning {
    /// Explicit partition.
    pub fn partition_id(id: u32) -> Self {
        Partitioning::PartitionId(id)
    }

    /// Key-based partitioning.
    pub fn messages_key(key: impl Into<Bytes>) -> Self {
        Partitioning::MessagesKey(key.into())
    }
}

impl fmt::Display for Partitioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partitioning::Balanced => f.write_str("balanced"),
            Partitioning::PartitionId(id) => write!(f, "partition({})", id),
            Partitioning::MessagesKey(key) => write!(f, "key({} bytes)", key.len()),
        }
    }
}

/// Whether a consumer reads alone or as a member of a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerKind {
    /// Standalone consumer
    #[default]
    Consumer,
    /// Consumer group member
    ConsumerGroup,
}

/// Identity under which a consumption position is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Consumer {
    /// Consumer kind
    #[serde(default)]
    pub kind: ConsumerKind,
    /// Consumer id
    pub id: ResourceIdentifier,
}

impl Consumer {
    /// Standalone consumer with the given id.
    pub fn new(id: ResourceIdentifier) -> Self {
        Self {
            kind: ConsumerKind::Consumer,
            id,
        }
    }

    /// Consumer group with the given id.
    pub fn group(id: ResourceIdentifier) -> Self {
        Self {
            kind: ConsumerKind::ConsumerGroup,
            id,
        }
    }
}

impl Default for Consumer {
    fn default() -> Self {
        Self::new(ResourceIdentifier::Numeric(1))
    }
}

impl fmt::Display for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConsumerKind::Consumer => write!(f, "consumer:{}", self.id),
            ConsumerKind::ConsumerGroup => write!(f, "group:{}", self.id),
        }
    }
}
