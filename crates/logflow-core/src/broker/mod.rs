//! Broker seam: session control and the RPCs the engine depends on.
//!
//! The engine never talks to a wire protocol directly. Anything that can
//! implement [`BrokerClient`] (a TCP/QUIC/HTTP client, a test double, the
//! bundled [`InMemoryBroker`]) can drive the provisioner and both loops.
//!
//! ## Offset conventions
//!
//! - Partition ids are 1-based.
//! - Offsets start at 0 and grow by one per appended message.
//! - A stored consumer offset is the *next offset to read*, so a consumer
//!   that has processed offsets `0..=6` stores `7`.

mod memory;

pub use memory::{Fault, InMemoryBroker, Operation};

use crate::identifier::ResourceIdentifier;
use crate::model::{
    Consumer, InboundMessage, OutboundMessage, Partitioning, PollingStrategy, StreamDescriptor,
    TopicDescriptor,
};
use crate::Result;
use async_trait::async_trait;
use std::fmt;

/// Username/password pair presented at login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A concrete fetch issued to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    /// Stream to read from
    pub stream: ResourceIdentifier,
    /// Topic to read from
    pub topic: ResourceIdentifier,
    /// 1-based partition id
    pub partition_id: u32,
    /// Identity whose stored offset `Next` and `auto_commit` refer to
    pub consumer: Consumer,
    /// Where to start reading
    pub strategy: PollingStrategy,
    /// Maximum number of messages to return
    pub count: u32,
    /// Whether the broker stores the consumer offset after this poll
    pub auto_commit: bool,
}

/// Messages returned by a poll, in ascending offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledMessages {
    /// Partition the messages came from
    pub partition_id: u32,
    /// Next offset the broker will assign in this partition
    pub high_water_mark: u64,
    /// The messages
    pub messages: Vec<InboundMessage>,
}

impl PolledMessages {
    /// Offset following the last returned message, if any were returned.
    pub fn next_offset(&self) -> Option<u64> {
        self.messages.last().map(|m| m.offset + 1)
    }
}

/// Range of offsets currently readable in a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionBounds {
    /// Lowest offset still retained
    pub low_water_mark: u64,
    /// Next offset the broker will assign
    pub high_water_mark: u64,
}

impl PartitionBounds {
    /// Create bounds.
    pub fn new(low_water_mark: u64, high_water_mark: u64) -> Self {
        Self {
            low_water_mark,
            high_water_mark,
        }
    }

    /// Whether no message is currently readable.
    pub fn is_empty(&self) -> bool {
        self.low_water_mark >= self.high_water_mark
    }

    /// Whether a read position is valid. Reading at the high-water mark is
    /// valid and simply returns nothing until new messages arrive.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.low_water_mark && offset <= self.high_water_mark
    }

    /// Number of readable messages.
    pub fn len(&self) -> u64 {
        self.high_water_mark.saturating_sub(self.low_water_mark)
    }
}

/// Broker acknowledgement of an accepted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendAck {
    /// Partition the batch was appended to
    pub partition_id: u32,
    /// Offset assigned to the first message of the batch
    pub base_offset: u64,
    /// Number of messages appended
    pub count: u32,
}

/// Connected client for a partitioned log broker.
///
/// Lookups return `Ok(None)` for a resource that does not exist; `Err` is
/// reserved for the lookup itself failing.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open the transport.
    async fn connect(&self) -> Result<()>;

    /// Authenticate the session.
    async fn login(&self, credentials: &Credentials) -> Result<()>;

    /// Check liveness.
    async fn ping(&self) -> Result<()>;

    /// Close the transport.
    async fn disconnect(&self) -> Result<()>;

    /// Look up a stream by id or name.
    async fn get_stream(&self, stream: &ResourceIdentifier) -> Result<Option<StreamDescriptor>>;

    /// Create a stream; the broker assigns the id.
    async fn create_stream(&self, name: &str) -> Result<StreamDescriptor>;

    /// Look up a topic by id or name within a stream.
    async fn get_topic(
        &self,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
    ) -> Result<Option<TopicDescriptor>>;

    /// Create a topic within a stream; the broker assigns the id.
    async fn create_topic(
        &self,
        stream: &ResourceIdentifier,
        name: &str,
        partitions_count: u32,
        replication_factor: u8,
    ) -> Result<TopicDescriptor>;

    /// Append a batch atomically: all messages are accepted or none are.
    async fn send_messages(
        &self,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
        partitioning: &Partitioning,
        messages: &[OutboundMessage],
    ) -> Result<SendAck>;

    /// Fetch messages.
    async fn poll_messages(&self, request: &PollRequest) -> Result<PolledMessages>;

    /// Get the readable offset range of a partition.
    async fn partition_bounds(
        &self,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
        partition_id: u32,
    ) -> Result<PartitionBounds>;

    /// Get the stored offset (next offset to read) of a consumer.
    async fn get_consumer_offset(
        &self,
        consumer: &Consumer,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
        partition_id: u32,
    ) -> Result<Option<u64>>;

    /// Store the offset (next offset to read) of a consumer.
    async fn store_consumer_offset(
        &self,
        consumer: &Consumer,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
        partition_id: u32,
        offset: u64,
    ) -> Result<()>;
}
