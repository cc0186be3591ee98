//! The consume loop: poll, hand off, advance, sleep.

use super::handler::{DeliveryMode, MessageHandler};
use super::offset::{OffsetTracker, PositionKey};
use super::strategy::StrategyResolver;
use crate::broker::{BrokerClient, PollRequest, PolledMessages};
use crate::config::ConsumerConfig;
use crate::events::{EngineEvent, Observer, StopReason};
use crate::identifier::ResourceIdentifier;
use crate::model::{InboundMessage, PollingStrategy};
use crate::retry::RetryConfig;
use crate::{Error, ErrorKind, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Result of one completed poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to read at `offset`; the position is unchanged
    Empty { offset: u64 },
    /// `count` messages were handled and the position moved to `next_offset`
    Handled { count: usize, next_offset: u64 },
}

/// Counters of a consume loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    /// Poll cycles attempted
    pub cycles: u64,
    /// Messages handled successfully
    pub messages_handled: u64,
    /// Polls that returned nothing
    pub empty_polls: u64,
    /// Failed polls
    pub poll_failures: u64,
    /// Failed handler passes
    pub handler_failures: u64,
    /// Read position clamps
    pub position_adjustments: u64,
    /// Next offset to read when the summary was taken
    pub position: u64,
    /// Why the loop stopped, once it has
    pub stop_reason: Option<StopReason>,
}

/// Repeatedly polls one partition and hands messages to a handler.
///
/// The configured strategy decides where the first poll starts. Every later
/// poll continues from the tracked position, which only advances after the
/// handler has processed a whole poll:
/// - without `auto_commit` it advances by the number of messages polled;
/// - with `auto_commit` it is resynchronized from the broker's stored offset.
pub struct ConsumeLoop {
    client: Arc<dyn BrokerClient>,
    config: ConsumerConfig,
    key: PositionKey,
    handler: Arc<dyn MessageHandler>,
    tracker: Arc<OffsetTracker>,
    resolver: StrategyResolver,
    retry: RetryConfig,
    observer: Observer,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: Option<broadcast::Receiver<()>>,
    consecutive_failures: u32,
    summary: ConsumeSummary,
}

impl ConsumeLoop {
    /// Create a consume loop for one partition of `stream`/`topic`.
    pub fn new(
        client: Arc<dyn BrokerClient>,
        stream: ResourceIdentifier,
        topic: ResourceIdentifier,
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let key = PositionKey::new(
            stream,
            topic,
            config.partition_id,
            config.identity.clone(),
        );
        let resolver = StrategyResolver::new(config.messages_per_poll);
        let retry = config.retry.to_retry_config();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Self {
            client,
            config,
            key,
            handler,
            tracker: Arc::new(OffsetTracker::new()),
            resolver,
            retry,
            observer: Observer::tracing(),
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            consecutive_failures: 0,
            summary: ConsumeSummary::default(),
        }
    }

    /// Report events to `observer` instead of the default tracing sink.
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    /// Share a position tracker, e.g. with another loop or a restarted one.
    pub fn with_tracker(mut self, tracker: Arc<OffsetTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Override the backoff used between retried polls.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Stop after `max_cycles` polls.
    pub fn with_max_cycles(mut self, max_cycles: u64) -> Self {
        self.config.max_cycles = Some(max_cycles);
        self
    }

    /// Get shutdown signal sender.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Position tracker.
    pub fn tracker(&self) -> &Arc<OffsetTracker> {
        &self.tracker
    }

    /// Key the position is tracked under.
    pub fn position_key(&self) -> &PositionKey {
        &self.key
    }

    /// Next offset to read.
    pub fn position(&self) -> u64 {
        self.tracker.current(&self.key)
    }

    /// Counters so far.
    pub fn summary(&self) -> ConsumeSummary {
        ConsumeSummary {
            position: self.position(),
            ..self.summary.clone()
        }
    }

    /// Run until shutdown, the cycle limit, or a failure the configured
    /// policy does not continue past.
    pub async fn run(&mut self) -> Result<ConsumeSummary> {
        info!(
            stream = %self.key.stream,
            topic = %self.key.topic,
            partition_id = self.key.partition_id,
            consumer = %self.key.consumer,
            strategy = %self.config.strategy,
            interval_ms = self.config.interval_ms,
            "Messages will be consumed"
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
                result = self.poll_once() => result,
            };

            let delay = match result {
                Ok(_) => self.config.interval(),
                Err(e) => match self.delay_after_failure(&e) {
                    Some(delay) => delay,
                    None => break Err(e),
                },
            };

            if self.limit_reached() {
                break Ok(StopReason::LimitReached);
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break Ok(StopReason::Shutdown),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        let reason = match &outcome {
            Ok(reason) => *reason,
            Err(e) => StopReason::Failed(e.kind()),
        };
        self.summary.stop_reason = Some(reason);
        self.observer.emit(EngineEvent::LoopStopped {
            name: "consume",
            reason,
        });

        outcome.map(|_| self.summary())
    }

    /// Run a single cycle: resolve the start, poll, hand off, advance.
    ///
    /// Failures are reported to the observer before being returned.
    pub async fn poll_once(&mut self) -> Result<CycleOutcome> {
        self.summary.cycles += 1;

        let (start, polled) = match self.fetch().await {
            Ok(fetched) => fetched,
            Err(e) => return Err(self.poll_failed(e)),
        };

        if polled.messages.is_empty() {
            self.consecutive_failures = 0;
            self.summary.empty_polls += 1;
            self.observer.emit(EngineEvent::EmptyPoll {
                partition_id: self.key.partition_id,
                offset: start,
            });
            return Ok(CycleOutcome::Empty { offset: start });
        }

        let messages = polled.messages;
        if let Err(e) = self.deliver(&messages).await {
            self.summary.handler_failures += 1;
            if let Error::Handler { offset, message } = &e {
                self.observer.emit(EngineEvent::HandlerFailed {
                    offset: *offset,
                    message: message.clone(),
                });
            }
            return Err(e);
        }

        let count = messages.len();
        let next_offset = if self.config.auto_commit {
            match self.committed_offset().await {
                Ok(committed) => self.tracker.resync(&self.key, committed),
                Err(e) => return Err(self.poll_failed(e)),
            }
        } else {
            self.tracker.advance(&self.key, count as u64)
        };
        self.consecutive_failures = 0;

        self.summary.messages_handled += count as u64;
        self.observer.emit(EngineEvent::MessagesHandled {
            partition_id: self.key.partition_id,
            count,
            next_offset,
        });

        Ok(CycleOutcome::Handled { count, next_offset })
    }

    /// Seed the position if needed, clamp it to the partition's bounds and
    /// issue the poll. Returns the offset the poll started at.
    async fn fetch(&mut self) -> Result<(u64, PolledMessages)> {
        let bounds = self
            .client
            .partition_bounds(&self.key.stream, &self.key.topic, self.key.partition_id)
            .await?;

        if !self.tracker.is_tracked(&self.key) {
            let start = match self.config.strategy {
                PollingStrategy::Next => self
                    .client
                    .get_consumer_offset(
                        &self.key.consumer,
                        &self.key.stream,
                        &self.key.topic,
                        self.key.partition_id,
                    )
                    .await?
                    .unwrap_or(bounds.low_water_mark),
                strategy => self.resolver.resolve(strategy, 0, &bounds).offset,
            };
            self.tracker.seed(&self.key, start);
        }

        let current = self.tracker.current(&self.key);
        let fetch = self
            .resolver
            .resolve(PollingStrategy::Next, current, &bounds);
        if let Some(adjustment) = fetch.adjustment {
            self.tracker.reposition(&self.key, adjustment.adjusted);
            self.summary.position_adjustments += 1;
            self.observer.emit(EngineEvent::PositionAdjusted {
                partition_id: self.key.partition_id,
                adjustment,
            });
        }

        let request = PollRequest {
            stream: self.key.stream.clone(),
            topic: self.key.topic.clone(),
            partition_id: self.key.partition_id,
            consumer: self.key.consumer.clone(),
            strategy: fetch.strategy(),
            count: self.config.messages_per_poll,
            auto_commit: self.config.auto_commit,
        };
        debug!(
            partition_id = request.partition_id,
            offset = fetch.offset,
            count = request.count,
            "Polling messages"
        );
        let polled = self.client.poll_messages(&request).await?;
        Ok((fetch.offset, polled))
    }

    async fn deliver(&self, messages: &[InboundMessage]) -> Result<()> {
        match self.config.delivery {
            DeliveryMode::PerMessage => {
                for message in messages {
                    self.handler
                        .handle(message)
                        .await
                        .map_err(|e| Error::Handler {
                            offset: message.offset,
                            message: e.to_string(),
                        })?;
                }
                Ok(())
            }
            DeliveryMode::Batch => {
                // Batch failures are reported at the batch's first offset
                let offset = messages.first().map(|m| m.offset).unwrap_or_default();
                self.handler
                    .handle_batch(messages)
                    .await
                    .map_err(|e| Error::Handler {
                        offset,
                        message: e.to_string(),
                    })
            }
        }
    }

    async fn committed_offset(&self) -> Result<u64> {
        self.client
            .get_consumer_offset(
                &self.key.consumer,
                &self.key.stream,
                &self.key.topic,
                self.key.partition_id,
            )
            .await?
            .ok_or_else(|| {
                Error::Poll(format!(
                    "no stored offset for {} after an auto-commit poll",
                    self.key.consumer
                ))
            })
    }

    fn poll_failed(&mut self, error: Error) -> Error {
        self.consecutive_failures += 1;
        self.summary.poll_failures += 1;
        self.observer.emit(EngineEvent::PollFailed {
            kind: error.kind(),
            message: error.to_string(),
            consecutive_failures: self.consecutive_failures,
        });
        error
    }

    /// Delay before the next cycle, or `None` when the loop must stop.
    fn delay_after_failure(&self, error: &Error) -> Option<Duration> {
        let kind = error.kind();
        if kind == ErrorKind::Handler {
            if self.config.on_handler_error.stops_on(kind) {
                return None;
            }
            return Some(self.config.interval());
        }

        if self.config.on_poll_error.stops_on(kind)
            || !self.retry.allows_retry(self.consecutive_failures)
        {
            return None;
        }
        let delay = self
            .retry
            .calculate_delay(self.consecutive_failures.saturating_sub(1));
        debug!(
            failures = self.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            "Retrying poll after backoff"
        );
        Some(delay)
    }

    fn limit_reached(&self) -> bool {
        self.config
            .max_cycles
            .is_some_and(|max| self.summary.cycles >= max)
    }
}
