//! Bounded batch dispatch.

use crate::broker::{BrokerClient, SendAck};
use crate::events::{EngineEvent, Observer};
use crate::identifier::ResourceIdentifier;
use crate::model::{OutboundMessage, Partitioning};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A batch accepted by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Producer-local batch id
    pub batch_id: u64,
    /// Messages in the batch
    pub count: usize,
    /// Broker acknowledgement
    pub ack: SendAck,
}

/// Sends batches of at most `messages_per_batch` messages to one topic.
///
/// Every call to [`send`](Self::send) is exactly one batch and at most one
/// broker call. Batches are never split, merged, or retried, and a partial
/// acceptance counts as a failed dispatch.
pub struct BatchProducer {
    client: Arc<dyn BrokerClient>,
    stream: ResourceIdentifier,
    topic: ResourceIdentifier,
    messages_per_batch: u32,
    next_batch_id: AtomicU64,
    observer: Observer,
}

impl BatchProducer {
    /// Create a producer for `stream`/`topic`.
    pub fn new(
        client: Arc<dyn BrokerClient>,
        stream: ResourceIdentifier,
        topic: ResourceIdentifier,
        messages_per_batch: u32,
    ) -> Self {
        Self {
            client,
            stream,
            topic,
            messages_per_batch,
            next_batch_id: AtomicU64::new(1),
            observer: Observer::tracing(),
        }
    }

    /// Report events to `observer` instead of the default tracing sink.
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    /// Upper bound on batch size.
    pub fn messages_per_batch(&self) -> u32 {
        self.messages_per_batch
    }

    /// Stream the producer writes to.
    pub fn stream(&self) -> &ResourceIdentifier {
        &self.stream
    }

    /// Topic the producer writes to.
    pub fn topic(&self) -> &ResourceIdentifier {
        &self.topic
    }

    /// Dispatch one batch.
    pub async fn send(
        &self,
        partitioning: &Partitioning,
        messages: Vec<OutboundMessage>,
    ) -> Result<DispatchReport> {
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        let count = messages.len();

        match self.dispatch(partitioning, &messages).await {
            Ok(ack) => {
                self.observer.emit(EngineEvent::BatchDispatched {
                    batch_id,
                    count,
                    partition_id: ack.partition_id,
                    base_offset: ack.base_offset,
                });
                Ok(DispatchReport {
                    batch_id,
                    count,
                    ack,
                })
            }
            Err(e) => {
                self.observer.emit(EngineEvent::DispatchFailed {
                    batch_id,
                    count,
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        partitioning: &Partitioning,
        messages: &[OutboundMessage],
    ) -> Result<SendAck> {
        if messages.is_empty() {
            return Err(Error::InvalidBatch("batch is empty".into()));
        }
        if messages.len() > self.messages_per_batch as usize {
            return Err(Error::InvalidBatch(format!(
                "batch of {} messages exceeds messages_per_batch {}",
                messages.len(),
                self.messages_per_batch
            )));
        }

        let ack = self
            .client
            .send_messages(&self.stream, &self.topic, partitioning, messages)
            .await?;

        if ack.count as usize != messages.len() {
            return Err(Error::Dispatch(format!(
                "broker accepted {} of {} messages",
                ack.count,
                messages.len()
            )));
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Fault, InMemoryBroker, Operation};
    use crate::events::MemorySink;
    use crate::ErrorKind;

    async fn setup(partitions: u32) -> (Arc<InMemoryBroker>, BatchProducer, Arc<MemorySink>) {
        let broker = Arc::new(InMemoryBroker::connected());
        broker.create_stream("sample-stream").await.unwrap();
        let stream = ResourceIdentifier::Named("sample-stream".into());
        broker
            .create_topic(&stream, "sample-topic", partitions, 1)
            .await
            .unwrap();

        let sink = Arc::new(MemorySink::new());
        let producer = BatchProducer::new(
            broker.clone(),
            stream,
            ResourceIdentifier::Named("sample-topic".into()),
            10,
        )
        .with_observer(Observer::new().with_sink(sink.clone()));
        (broker, producer, sink)
    }

    fn batch(n: usize) -> Vec<OutboundMessage> {
        (1..=n)
            .map(|i| OutboundMessage::from(format!("message-{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_send_assigns_increasing_batch_ids() {
        let (broker, producer, sink) = setup(1).await;

        let first = producer
            .send(&Partitioning::PartitionId(1), batch(10))
            .await
            .unwrap();
        let second = producer
            .send(&Partitioning::PartitionId(1), batch(3))
            .await
            .unwrap();

        assert_eq!(first.batch_id, 1);
        assert_eq!(second.batch_id, 2);
        assert_eq!(first.ack.base_offset, 0);
        assert_eq!(second.ack.base_offset, 10);
        assert_eq!(second.count, 3);
        assert_eq!(broker.calls(Operation::SendMessages), 2);
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::BatchDispatched { .. })),
            2
        );
    }

    #[tokio::test]
    async fn test_oversized_and_empty_batches_rejected_without_dispatch() {
        let (broker, producer, sink) = setup(1).await;

        let err = producer
            .send(&Partitioning::PartitionId(1), batch(11))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidBatch);

        let err = producer
            .send(&Partitioning::PartitionId(1), Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidBatch);

        assert_eq!(broker.calls(Operation::SendMessages), 0);
        assert_eq!(sink.failures().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_batch_reports_one_failure() {
        let (broker, producer, sink) = setup(1).await;
        broker.inject_fault(
            Operation::SendMessages,
            Fault::Rejected("segment full".into()),
        );

        let err = producer
            .send(&Partitioning::PartitionId(1), batch(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dispatch);

        let failures = sink.failures();
        assert_eq!(failures.len(), 1);
        match &failures[0] {
            EngineEvent::DispatchFailed {
                batch_id,
                count,
                kind,
                message,
            } => {
                assert_eq!(*batch_id, 1);
                assert_eq!(*count, 5);
                assert_eq!(*kind, ErrorKind::Dispatch);
                assert!(message.contains("segment full"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let (_, producer, _) = setup(4).await;
        let key = Partitioning::messages_key("tenant-7");

        let first = producer.send(&key, batch(2)).await.unwrap();
        let second = producer.send(&key, batch(2)).await.unwrap();
        assert_eq!(first.ack.partition_id, second.ack.partition_id);
        assert_eq!(second.ack.base_offset, 2);
    }
}
