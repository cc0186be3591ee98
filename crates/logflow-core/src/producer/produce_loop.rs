//! The produce loop: build a batch, send it, sleep.

use super::batch::{BatchProducer, DispatchReport};
use super::payload::{PayloadSource, SequentialPayloads};
use crate::config::ProducerConfig;
use crate::events::{EngineEvent, Observer, StopReason};
use crate::model::{OutboundMessage, Partitioning};
use crate::Result;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Result of one production cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// A batch was accepted
    Dispatched(DispatchReport),
    /// The payload source had nothing left; no batch was sent
    Exhausted,
}

/// Counters of a produce loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProduceSummary {
    /// Batches built and dispatched, successfully or not
    pub batches: u64,
    /// Batches accepted by the broker
    pub batches_sent: u64,
    /// Messages accepted by the broker
    pub messages_sent: u64,
    /// Batches that failed
    pub dispatch_failures: u64,
    /// Id of the last message built
    pub last_id: u64,
    /// Why the loop stopped, once it has
    pub stop_reason: Option<StopReason>,
}

/// Repeatedly builds one batch from a payload source and dispatches it.
///
/// Message ids start at 1 and advance once per message built, whether or
/// not its batch is accepted.
pub struct ProduceLoop {
    producer: BatchProducer,
    config: ProducerConfig,
    partitioning: Partitioning,
    source: Box<dyn PayloadSource>,
    observer: Observer,
    current_id: u64,
    exhausted: bool,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: Option<broadcast::Receiver<()>>,
    summary: ProduceSummary,
}

impl ProduceLoop {
    /// Create a produce loop generating `"{payload_prefix}-{id}"` payloads.
    pub fn new(producer: BatchProducer, config: ProducerConfig) -> Self {
        let source = Box::new(SequentialPayloads::new(config.payload_prefix.clone()));
        let partitioning = config.partitioning.to_partitioning();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Self {
            producer,
            config,
            partitioning,
            source,
            observer: Observer::tracing(),
            current_id: 0,
            exhausted: false,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            summary: ProduceSummary::default(),
        }
    }

    /// Take payloads from `source` instead of the generator.
    pub fn with_source(mut self, source: Box<dyn PayloadSource>) -> Self {
        self.source = source;
        self
    }

    /// Report loop events to `observer` instead of the default tracing sink.
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    /// Stop after `max_batches` batches.
    pub fn with_max_batches(mut self, max_batches: u64) -> Self {
        self.config.max_batches = Some(max_batches);
        self
    }

    /// Get shutdown signal sender.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Id of the last message built.
    pub fn current_id(&self) -> u64 {
        self.current_id
    }

    /// Counters so far.
    pub fn summary(&self) -> ProduceSummary {
        ProduceSummary {
            last_id: self.current_id,
            ..self.summary.clone()
        }
    }

    /// Run until shutdown, the batch limit, source exhaustion, or a failure
    /// the dispatch policy does not continue past.
    pub async fn run(&mut self) -> Result<ProduceSummary> {
        info!(
            stream = %self.producer.stream(),
            topic = %self.producer.topic(),
            partitioning = %self.partitioning,
            messages_per_batch = self.producer.messages_per_batch(),
            interval_ms = self.config.interval_ms,
            "Messages will be sent"
        );

        let mut shutdown_rx = match self.shutdown_rx.take() {
            Some(rx) => rx,
            None => self.shutdown_tx.subscribe(),
        };

        let outcome = loop {
            if self.limit_reached() {
                break Ok(StopReason::LimitReached);
            }

            let result = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break Ok(StopReason::Shutdown),
                result = self.produce_once() => result,
            };

            match result {
                Ok(BatchOutcome::Exhausted) => break Ok(StopReason::SourceExhausted),
                Ok(BatchOutcome::Dispatched(_)) => {}
                Err(e) => {
                    if self.config.on_dispatch_error.stops_on(e.kind()) {
                        break Err(e);
                    }
                }
            }

            if self.limit_reached() {
                break Ok(StopReason::LimitReached);
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break Ok(StopReason::Shutdown),
                _ = tokio::time::sleep(self.config.interval()) => {}
            }
        };

        let reason = match &outcome {
            Ok(reason) => *reason,
            Err(e) => StopReason::Failed(e.kind()),
        };
        self.summary.stop_reason = Some(reason);
        self.observer.emit(EngineEvent::LoopStopped {
            name: "produce",
            reason,
        });

        outcome.map(|_| self.summary())
    }

    /// Build one batch and dispatch it.
    pub async fn produce_once(&mut self) -> Result<BatchOutcome> {
        let messages = self.build_batch();
        if messages.is_empty() {
            return Ok(BatchOutcome::Exhausted);
        }

        self.summary.batches += 1;
        let count = messages.len();
        match self.producer.send(&self.partitioning, messages).await {
            Ok(report) => {
                self.summary.batches_sent += 1;
                self.summary.messages_sent += count as u64;
                Ok(BatchOutcome::Dispatched(report))
            }
            Err(e) => {
                self.summary.dispatch_failures += 1;
                Err(e)
            }
        }
    }

    fn build_batch(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::with_capacity(self.producer.messages_per_batch() as usize);
        if self.exhausted {
            return messages;
        }

        for _ in 0..self.producer.messages_per_batch() {
            match self.source.next_payload(self.current_id + 1) {
                Some(payload) => {
                    self.current_id += 1;
                    messages.push(OutboundMessage::new(payload));
                }
                None => {
                    debug!(last_id = self.current_id, "Payload source exhausted");
                    self.exhausted = true;
                    break;
                }
            }
        }
        messages
    }

    fn limit_reached(&self) -> bool {
        self.config
            .max_batches
            .is_some_and(|max| self.summary.batches >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerClient, Fault, InMemoryBroker, Operation};
    use crate::events::{EventLevel, MemorySink};
    use crate::identifier::ResourceIdentifier;
    use crate::producer::FinitePayloads;
    use crate::retry::FailurePolicy;
    use crate::ErrorKind;
    use std::sync::Arc;

    fn stream() -> ResourceIdentifier {
        ResourceIdentifier::Named("sample-stream".into())
    }

    fn topic() -> ResourceIdentifier {
        ResourceIdentifier::Named("sample-topic".into())
    }

    async fn setup(config: ProducerConfig) -> (Arc<InMemoryBroker>, ProduceLoop, Arc<MemorySink>) {
        let broker = Arc::new(InMemoryBroker::connected());
        broker.create_stream("sample-stream").await.unwrap();
        broker
            .create_topic(&stream(), "sample-topic", 1, 1)
            .await
            .unwrap();

        let sink = Arc::new(MemorySink::new());
        let observer = Observer::new().with_sink(sink.clone());
        let producer = BatchProducer::new(
            broker.clone(),
            stream(),
            topic(),
            config.messages_per_batch,
        )
        .with_observer(observer.clone());
        let produce = ProduceLoop::new(producer, config).with_observer(observer);
        (broker, produce, sink)
    }

    fn config() -> ProducerConfig {
        ProducerConfig {
            interval_ms: 10,
            ..ProducerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_generated_payloads_and_ids() {
        let (broker, produce, _) = setup(config()).await;
        let mut produce = produce.with_max_batches(2);

        let summary = produce.run().await.unwrap();
        assert_eq!(summary.stop_reason, Some(StopReason::LimitReached));
        assert_eq!(summary.batches_sent, 2);
        assert_eq!(summary.messages_sent, 20);
        assert_eq!(summary.last_id, 20);

        let bounds = broker.partition_bounds(&stream(), &topic(), 1).await.unwrap();
        assert_eq!(bounds.high_water_mark, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_bounded_by_messages_per_batch() {
        let n = 4;
        let (_, produce, sink) = setup(ProducerConfig {
            messages_per_batch: n,
            ..config()
        })
        .await;
        let payloads: Vec<String> = (1..=(2 * n + 3)).map(|i| format!("p-{}", i)).collect();
        let mut produce = produce.with_source(Box::new(FinitePayloads::new(payloads)));

        let summary = produce.run().await.unwrap();
        assert_eq!(summary.stop_reason, Some(StopReason::SourceExhausted));

        let sizes: Vec<usize> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::BatchDispatched { count, .. } => Some(count),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![4, 4, 3]);
        assert!(sizes.iter().all(|s| *s <= n as usize));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_does_not_halt_by_default() {
        let (broker, produce, sink) = setup(config()).await;
        broker.inject_fault(Operation::SendMessages, Fault::Rejected("busy".into()));
        let mut produce = produce.with_max_batches(3);

        let summary = produce.run().await.unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.dispatch_failures, 1);
        assert_eq!(summary.batches_sent, 2);
        // Ids of the failed batch are not reused
        assert_eq!(summary.last_id, 30);
        assert_eq!(sink.failures().len(), 1);

        let polled = broker
            .poll_messages(&crate::broker::PollRequest {
                stream: stream(),
                topic: topic(),
                partition_id: 1,
                consumer: Default::default(),
                strategy: crate::model::PollingStrategy::First,
                count: 1,
                auto_commit: false,
            })
            .await
            .unwrap();
        assert_eq!(polled.messages[0].payload_str(), Some("message-11"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_policy_stops_on_dispatch_error() {
        let (broker, produce, sink) = setup(ProducerConfig {
            on_dispatch_error: FailurePolicy::Terminate,
            ..config()
        })
        .await;
        broker.inject_fault(Operation::SendMessages, Fault::Rejected("busy".into()));
        let mut produce = produce;

        let err = produce.run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dispatch);
        assert_eq!(
            produce.summary().stop_reason,
            Some(StopReason::Failed(ErrorKind::Dispatch))
        );

        // The stop itself is not reported as a second failure
        assert_eq!(sink.count(|e| e.level() == EventLevel::Error), 1);
        assert_eq!(sink.failures().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_stops_loop() {
        let (_, produce, _) = setup(config()).await;
        let mut produce = produce;
        let shutdown = produce.shutdown_signal();

        let handle = tokio::spawn(async move {
            let summary = produce.run().await;
            (summary, produce.current_id())
        });
        tokio::time::sleep(std::time::Duration::from_millis(35)).await;
        shutdown.send(()).unwrap();

        let (summary, current_id) = handle.await.unwrap();
        let summary = summary.unwrap();
        assert_eq!(summary.stop_reason, Some(StopReason::Shutdown));
        assert!(summary.batches_sent >= 1);
        assert_eq!(current_id, summary.batches_sent * 10);
    }
}
