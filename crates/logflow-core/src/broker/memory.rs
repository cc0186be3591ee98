//! In-process broker implementing the full [`BrokerClient`] seam.
//!
//! Used by the CLI's embedded mode and by tests. It behaves like a single
//! broker node: ids are assigned on creation, partitions are 1-based,
//! key partitioning hashes with CRC32, and consumer offsets are stored per
//! consumer identity. Retention trimming and one-shot fault injection let
//! tests reproduce the edge cases the engine must handle.

use super::{BrokerClient, Credentials, PartitionBounds, PollRequest, PolledMessages, SendAck};
use crate::identifier::ResourceIdentifier;
use crate::model::{
    Consumer, InboundMessage, OutboundMessage, Partitioning, PollingStrategy, StreamDescriptor,
    TopicDescriptor,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

/// Broker operations, used to count calls and target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Login,
    Ping,
    Disconnect,
    GetStream,
    CreateStream,
    GetTopic,
    CreateTopic,
    SendMessages,
    PollMessages,
    PartitionBounds,
    GetConsumerOffset,
    StoreConsumerOffset,
}

/// A failure to return from the next call of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Transport failure
    Connection(String),
    /// Authentication failure
    Auth(String),
    /// The broker rejected the request
    Rejected(String),
}

impl Fault {
    fn into_error(self, operation: Operation) -> Error {
        match self {
            Fault::Connection(message) => Error::Connection(message),
            Fault::Auth(message) => Error::Auth(message),
            Fault::Rejected(message) => match operation {
                Operation::GetStream => Error::ResourceLookup {
                    resource: "stream".into(),
                    message,
                },
                Operation::GetTopic => Error::ResourceLookup {
                    resource: "topic".into(),
                    message,
                },
                Operation::CreateStream => Error::ResourceCreate {
                    resource: "stream".into(),
                    message,
                },
                Operation::CreateTopic => Error::ResourceCreate {
                    resource: "topic".into(),
                    message,
                },
                Operation::SendMessages => Error::Dispatch(message),
                Operation::Connect | Operation::Ping | Operation::Disconnect => {
                    Error::Connection(message)
                }
                Operation::Login => Error::Auth(message),
                Operation::PollMessages
                | Operation::PartitionBounds
                | Operation::GetConsumerOffset
                | Operation::StoreConsumerOffset => Error::Poll(message),
            },
        }
    }
}

struct PartitionState {
    low_water_mark: u64,
    messages: VecDeque<InboundMessage>,
    consumer_offsets: HashMap<Consumer, u64>,
}

impl PartitionState {
    fn new() -> Self {
        Self {
            low_water_mark: 0,
            messages: VecDeque::new(),
            consumer_offsets: HashMap::new(),
        }
    }

    fn high_water_mark(&self) -> u64 {
        self.low_water_mark + self.messages.len() as u64
    }

    fn bounds(&self) -> PartitionBounds {
        PartitionBounds::new(self.low_water_mark, self.high_water_mark())
    }
}

struct TopicState {
    descriptor: TopicDescriptor,
    partitions: Vec<PartitionState>,
    next_balanced: u32,
}

impl TopicState {
    fn partition(&self, partition_id: u32) -> Option<&PartitionState> {
        partition_id
            .checked_sub(1)
            .and_then(|idx| self.partitions.get(idx as usize))
    }

    fn partition_mut(&mut self, partition_id: u32) -> Option<&mut PartitionState> {
        partition_id
            .checked_sub(1)
            .and_then(|idx| self.partitions.get_mut(idx as usize))
    }
}

struct StreamState {
    descriptor: StreamDescriptor,
    topics: BTreeMap<u32, TopicState>,
    next_topic_id: u32,
}

struct BrokerState {
    connected: bool,
    authenticated: bool,
    streams: BTreeMap<u32, StreamState>,
    next_stream_id: u32,
}

impl BrokerState {
    fn stream(&self, stream: &ResourceIdentifier) -> Option<&StreamState> {
        self.streams
            .values()
            .find(|s| stream.matches(s.descriptor.id, &s.descriptor.name))
    }

    fn stream_mut(&mut self, stream: &ResourceIdentifier) -> Option<&mut StreamState> {
        self.streams
            .values_mut()
            .find(|s| stream.matches(s.descriptor.id, &s.descriptor.name))
    }

    fn topic(
        &self,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
    ) -> Option<&TopicState> {
        self.stream(stream)?
            .topics
            .values()
            .find(|t| topic.matches(t.descriptor.id, &t.descriptor.name))
    }

    fn topic_mut(
        &mut self,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
    ) -> Option<&mut TopicState> {
        self.stream_mut(stream)?
            .topics
            .values_mut()
            .find(|t| topic.matches(t.descriptor.id, &t.descriptor.name))
    }
}

/// In-memory broker.
pub struct InMemoryBroker {
    state: RwLock<BrokerState>,
    credentials: Option<Credentials>,
    faults: Mutex<HashMap<Operation, VecDeque<Fault>>>,
    calls: Mutex<HashMap<Operation, usize>>,
}

impl InMemoryBroker {
    /// Create a broker that accepts any session once connected.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(BrokerState {
                connected: false,
                authenticated: false,
                streams: BTreeMap::new(),
                next_stream_id: 1,
            }),
            credentials: None,
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Create a broker that requires a login with these credentials.
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..Self::new()
        }
    }

    /// Create a broker that is already connected and needs no login.
    pub fn connected() -> Self {
        let broker = Self::new();
        broker.state.write().connected = true;
        broker
    }

    /// Make the next call of `operation` fail with `fault`. Faults queue up
    /// per operation and are consumed one per call.
    pub fn inject_fault(&self, operation: Operation, fault: Fault) {
        self.faults
            .lock()
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    /// Number of calls made to `operation`, including failed ones.
    pub fn calls(&self, operation: Operation) -> usize {
        self.calls.lock().get(&operation).copied().unwrap_or(0)
    }

    /// Drop up to `count` of the oldest messages in a partition, as a
    /// retention policy would. Returns the new low-water mark.
    pub fn trim_partition(
        &self,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
        partition_id: u32,
        count: u64,
    ) -> Result<u64> {
        let mut state = self.state.write();
        let partition = state
            .topic_mut(stream, topic)
            .and_then(|t| t.partition_mut(partition_id))
            .ok_or_else(|| Error::Poll(format!("partition {} not found", partition_id)))?;

        for _ in 0..count {
            if partition.messages.pop_front().is_none() {
                break;
            }
            partition.low_water_mark += 1;
        }

        debug!(
            partition_id,
            low_water_mark = partition.low_water_mark,
            "Partition trimmed"
        );
        Ok(partition.low_water_mark)
    }

    /// Delete every message and restart the partition's offsets at zero.
    /// Stored consumer offsets are kept, so they may now point past the end.
    pub fn purge_partition(
        &self,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
        partition_id: u32,
    ) -> Result<()> {
        let mut state = self.state.write();
        let partition = state
            .topic_mut(stream, topic)
            .and_then(|t| t.partition_mut(partition_id))
            .ok_or_else(|| Error::Poll(format!("partition {} not found", partition_id)))?;
        partition.messages.clear();
        partition.low_water_mark = 0;
        Ok(())
    }

    /// Record the call, then fail with an injected fault or a session error.
    fn enter(&self, operation: Operation) -> Result<()> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;

        let fault = self
            .faults
            .lock()
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front());
        if let Some(fault) = fault {
            return Err(fault.into_error(operation));
        }

        let state = self.state.read();
        match operation {
            Operation::Connect => Ok(()),
            Operation::Login | Operation::Ping | Operation::Disconnect => {
                if !state.connected {
                    return Err(Error::Connection("not connected".into()));
                }
                Ok(())
            }
            _ => {
                if !state.connected {
                    return Err(Error::Connection("not connected".into()));
                }
                if self.credentials.is_some() && !state.authenticated {
                    return Err(Error::Auth("session is not authenticated".into()));
                }
                Ok(())
            }
        }
    }

    fn partition_for(topic: &mut TopicState, partitioning: &Partitioning) -> Result<u32> {
        let count = topic.descriptor.partitions_count;
        match partitioning {
            Partitioning::PartitionId(id) => {
                if topic.descriptor.has_partition(*id) {
                    Ok(*id)
                } else {
                    Err(Error::Dispatch(format!(
                        "partition {} not found in topic {} ({} partitions)",
                        id, topic.descriptor.name, count
                    )))
                }
            }
            Partitioning::MessagesKey(key) => Ok(crc32fast::hash(key) % count + 1),
            Partitioning::Balanced => {
                let id = topic.next_balanced % count + 1;
                topic.next_balanced = topic.next_balanced.wrapping_add(1);
                Ok(id)
            }
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.enter(Operation::Connect)?;
        self.state.write().connected = true;
        Ok(())
    }

    async fn login(&self, credentials: &Credentials) -> Result<()> {
        self.enter(Operation::Login)?;
        if let Some(expected) = &self.credentials {
            if expected != credentials {
                return Err(Error::Auth(format!(
                    "invalid credentials for user {}",
                    credentials.username
                )));
            }
        }
        self.state.write().authenticated = true;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.enter(Operation::Ping)
    }

    async fn disconnect(&self) -> Result<()> {
        self.enter(Operation::Disconnect)?;
        let mut state = self.state.write();
        state.connected = false;
        state.authenticated = false;
        Ok(())
    }

    async fn get_stream(&self, stream: &ResourceIdentifier) -> Result<Option<StreamDescriptor>> {
        self.enter(Operation::GetStream)?;
        Ok(self
            .state
            .read()
            .stream(stream)
            .map(|s| s.descriptor.clone()))
    }

    async fn create_stream(&self, name: &str) -> Result<StreamDescriptor> {
        self.enter(Operation::CreateStream)?;
        ResourceIdentifier::named(name).map_err(|e| Error::ResourceCreate {
            resource: "stream".into(),
            message: e.to_string(),
        })?;

        let mut state = self.state.write();
        if state.streams.values().any(|s| s.descriptor.name == name) {
            return Err(Error::ResourceCreate {
                resource: format!("stream {}", name),
                message: "already exists".into(),
            });
        }

        let id = state.next_stream_id;
        state.next_stream_id += 1;
        let descriptor = StreamDescriptor {
            id,
            name: name.to_string(),
        };
        state.streams.insert(
            id,
            StreamState {
                descriptor: descriptor.clone(),
                topics: BTreeMap::new(),
                next_topic_id: 1,
            },
        );
        Ok(descriptor)
    }

    async fn get_topic(
        &self,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
    ) -> Result<Option<TopicDescriptor>> {
        self.enter(Operation::GetTopic)?;
        let state = self.state.read();
        if state.stream(stream).is_none() {
            return Err(Error::ResourceLookup {
                resource: format!("topic {}", topic),
                message: format!("stream {} not found", stream),
            });
        }
        Ok(state.topic(stream, topic).map(|t| t.descriptor.clone()))
    }

    async fn create_topic(
        &self,
        stream: &ResourceIdentifier,
        name: &str,
        partitions_count: u32,
        replication_factor: u8,
    ) -> Result<TopicDescriptor> {
        self.enter(Operation::CreateTopic)?;
        let resource = format!("topic {}", name);
        ResourceIdentifier::named(name).map_err(|e| Error::ResourceCreate {
            resource: resource.clone(),
            message: e.to_string(),
        })?;
        if partitions_count == 0 || replication_factor == 0 {
            return Err(Error::ResourceCreate {
                resource,
                message: "partitions_count and replication_factor must be at least 1".into(),
            });
        }

        let mut state = self.state.write();
        let stream_state = state
            .stream_mut(stream)
            .ok_or_else(|| Error::ResourceCreate {
                resource: resource.clone(),
                message: format!("stream {} not found", stream),
            })?;
        if stream_state
            .topics
            .values()
            .any(|t| t.descriptor.name == name)
        {
            return Err(Error::ResourceCreate {
                resource,
                message: "already exists".into(),
            });
        }

        let id = stream_state.next_topic_id;
        stream_state.next_topic_id += 1;
        let descriptor = TopicDescriptor {
            id,
            name: name.to_string(),
            partitions_count,
            replication_factor,
        };
        stream_state.topics.insert(
            id,
            TopicState {
                descriptor: descriptor.clone(),
                partitions: (0..partitions_count).map(|_| PartitionState::new()).collect(),
                next_balanced: 0,
            },
        );
        Ok(descriptor)
    }

    async fn send_messages(
        &self,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
        partitioning: &Partitioning,
        messages: &[OutboundMessage],
    ) -> Result<SendAck> {
        self.enter(Operation::SendMessages)?;
        if messages.is_empty() {
            return Err(Error::Dispatch("batch is empty".into()));
        }

        let mut state = self.state.write();
        let topic_state = state
            .topic_mut(stream, topic)
            .ok_or_else(|| Error::Dispatch(format!("topic {} not found in {}", topic, stream)))?;
        let partition_id = Self::partition_for(topic_state, partitioning)?;
        let partition = topic_state
            .partition_mut(partition_id)
            .ok_or_else(|| Error::Dispatch(format!("partition {} not found", partition_id)))?;

        let base_offset = partition.high_water_mark();
        let timestamp = chrono::Utc::now();
        for (i, message) in messages.iter().enumerate() {
            partition.messages.push_back(InboundMessage {
                offset: base_offset + i as u64,
                payload: message.payload.clone(),
                timestamp,
            });
        }

        Ok(SendAck {
            partition_id,
            base_offset,
            count: messages.len() as u32,
        })
    }

    async fn poll_messages(&self, request: &PollRequest) -> Result<PolledMessages> {
        self.enter(Operation::PollMessages)?;
        let mut state = self.state.write();
        let partition = state
            .topic_mut(&request.stream, &request.topic)
            .and_then(|t| t.partition_mut(request.partition_id))
            .ok_or_else(|| {
                Error::Poll(format!(
                    "partition {} of {}/{} not found",
                    request.partition_id, request.stream, request.topic
                ))
            })?;

        let bounds = partition.bounds();
        let start = match request.strategy {
            PollingStrategy::Offset(value) => value,
            PollingStrategy::Next => partition
                .consumer_offsets
                .get(&request.consumer)
                .copied()
                .unwrap_or(bounds.low_water_mark),
            PollingStrategy::First => bounds.low_water_mark,
            PollingStrategy::Last => bounds
                .high_water_mark
                .saturating_sub(request.count as u64)
                .max(bounds.low_water_mark),
        }
        .max(bounds.low_water_mark);

        let skip = (start - bounds.low_water_mark) as usize;
        let messages: Vec<InboundMessage> = partition
            .messages
            .iter()
            .skip(skip)
            .take(request.count as usize)
            .cloned()
            .collect();

        if request.auto_commit {
            if let Some(last) = messages.last() {
                partition
                    .consumer_offsets
                    .insert(request.consumer.clone(), last.offset + 1);
            }
        }

        Ok(PolledMessages {
            partition_id: request.partition_id,
            high_water_mark: bounds.high_water_mark,
            messages,
        })
    }

    async fn partition_bounds(
        &self,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
        partition_id: u32,
    ) -> Result<PartitionBounds> {
        self.enter(Operation::PartitionBounds)?;
        self.state
            .read()
            .topic(stream, topic)
            .and_then(|t| t.partition(partition_id))
            .map(PartitionState::bounds)
            .ok_or_else(|| Error::Poll(format!("partition {} not found", partition_id)))
    }

    async fn get_consumer_offset(
        &self,
        consumer: &Consumer,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
        partition_id: u32,
    ) -> Result<Option<u64>> {
        self.enter(Operation::GetConsumerOffset)?;
        self.state
            .read()
            .topic(stream, topic)
            .and_then(|t| t.partition(partition_id))
            .map(|p| p.consumer_offsets.get(consumer).copied())
            .ok_or_else(|| Error::Poll(format!("partition {} not found", partition_id)))
    }

    async fn store_consumer_offset(
        &self,
        consumer: &Consumer,
        stream: &ResourceIdentifier,
        topic: &ResourceIdentifier,
        partition_id: u32,
        offset: u64,
    ) -> Result<()> {
        self.enter(Operation::StoreConsumerOffset)?;
        let mut state = self.state.write();
        let partition = state
            .topic_mut(stream, topic)
            .and_then(|t| t.partition_mut(partition_id))
            .ok_or_else(|| Error::Poll(format!("partition {} not found", partition_id)))?;
        partition.consumer_offsets.insert(consumer.clone(), offset);
        Ok(())
    }
}
