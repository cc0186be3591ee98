//! Engine events and the sinks that observe them.
//!
//! The provisioner and both loops report what they do as [`EngineEvent`]s
//! through an [`Observer`]. Each failure is reported exactly once, at the
//! point where the engine decides what to do about it.

use crate::consumer::PositionAdjustment;
use crate::identifier::ResourceIdentifier;
use crate::model::{StreamDescriptor, TopicDescriptor};
use crate::ErrorKind;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Why a loop stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A shutdown signal was received
    Shutdown,
    /// The configured cycle or batch limit was reached
    LimitReached,
    /// The payload source has nothing left to send
    SourceExhausted,
    /// A failure the loop's policy does not continue past
    Failed(ErrorKind),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Shutdown => f.write_str("shutdown"),
            StopReason::LimitReached => f.write_str("limit_reached"),
            StopReason::SourceExhausted => f.write_str("source_exhausted"),
            StopReason::Failed(kind) => write!(f, "failed({})", kind),
        }
    }
}

/// Step of session establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Connect,
    Ping,
    Login,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStage::Connect => f.write_str("connect"),
            SessionStage::Ping => f.write_str("ping"),
            SessionStage::Login => f.write_str("login"),
        }
    }
}

/// Something the engine did or observed.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A stream was found or created
    StreamReady {
        stream: StreamDescriptor,
        created: bool,
    },
    /// A topic was found or created
    TopicReady {
        stream: ResourceIdentifier,
        topic: TopicDescriptor,
        created: bool,
    },
    /// Connecting, waiting for ping, or logging in failed
    SessionFailed {
        stage: SessionStage,
        kind: ErrorKind,
        message: String,
    },
    /// Provisioning of a resource failed
    ProvisioningFailed {
        resource: String,
        kind: ErrorKind,
        message: String,
    },
    /// A poll returned nothing
    EmptyPoll { partition_id: u32, offset: u64 },
    /// The handler completed for every message of a poll
    MessagesHandled {
        partition_id: u32,
        count: usize,
        next_offset: u64,
    },
    /// A poll failed
    PollFailed {
        kind: ErrorKind,
        message: String,
        consecutive_failures: u32,
    },
    /// The handler failed; the position was not advanced
    HandlerFailed { offset: u64, message: String },
    /// The read position was moved to stay within the partition's bounds
    PositionAdjusted {
        partition_id: u32,
        adjustment: PositionAdjustment,
    },
    /// A batch was accepted by the broker
    BatchDispatched {
        batch_id: u64,
        count: usize,
        partition_id: u32,
        base_offset: u64,
    },
    /// A batch was rejected or could not be sent
    DispatchFailed {
        batch_id: u64,
        count: usize,
        kind: ErrorKind,
        message: String,
    },
    /// A loop stopped
    LoopStopped { name: &'static str, reason: StopReason },
}

impl EngineEvent {
    /// Severity of this event.
    pub fn level(&self) -> EventLevel {
        match self {
            EngineEvent::EmptyPoll { .. } | EngineEvent::MessagesHandled { .. } => {
                EventLevel::Debug
            }
            // The failure that stopped a loop has its own event
            EngineEvent::StreamReady { .. }
            | EngineEvent::TopicReady { .. }
            | EngineEvent::BatchDispatched { .. }
            | EngineEvent::LoopStopped { .. } => EventLevel::Info,
            EngineEvent::PositionAdjusted { .. } => EventLevel::Warn,
            EngineEvent::SessionFailed { .. }
            | EngineEvent::ProvisioningFailed { .. }
            | EngineEvent::PollFailed { .. }
            | EngineEvent::HandlerFailed { .. }
            | EngineEvent::DispatchFailed { .. } => EventLevel::Error,
        }
    }

    /// Error kind carried by a failure event.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            EngineEvent::SessionFailed { kind, .. }
            | EngineEvent::ProvisioningFailed { kind, .. }
            | EngineEvent::PollFailed { kind, .. }
            | EngineEvent::DispatchFailed { kind, .. } => Some(*kind),
            EngineEvent::HandlerFailed { .. } => Some(ErrorKind::Handler),
            _ => None,
        }
    }
}

/// Receives engine events.
pub trait EventSink: Send + Sync {
    /// Observe one event.
    fn emit(&self, event: &EngineEvent);
}

/// Fans events out to a set of sinks.
#[derive(Clone, Default)]
pub struct Observer {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Observer {
    /// Observer with no sinks.
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Observer that logs every event through `tracing`.
    pub fn tracing() -> Self {
        Self::new().with_sink(Arc::new(TracingSink))
    }

    /// Add a sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Deliver an event to every sink.
    pub fn emit(&self, event: EngineEvent) {
        for sink in &self.sinks {
            sink.emit(&event);
        }
    }
}

/// Logs events as structured `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &EngineEvent) {
        match event {
            EngineEvent::StreamReady { stream, created } => {
                info!(
                    stream_id = stream.id,
                    stream = %stream.name,
                    created = %created,
                    "Stream ready"
                );
            }
            EngineEvent::TopicReady {
                stream,
                topic,
                created,
            } => {
                info!(
                    stream = %stream,
                    topic_id = topic.id,
                    topic = %topic.name,
                    partitions = topic.partitions_count,
                    created = %created,
                    "Topic ready"
                );
            }
            EngineEvent::SessionFailed {
                stage,
                kind,
                message,
            } => {
                error!(stage = %stage, kind = %kind, error = %message, "Session failed");
            }
            EngineEvent::ProvisioningFailed {
                resource,
                kind,
                message,
            } => {
                error!(resource = %resource, kind = %kind, error = %message, "Provisioning failed");
            }
            EngineEvent::EmptyPoll {
                partition_id,
                offset,
            } => {
                debug!(partition_id = %partition_id, offset = %offset, "No messages found");
            }
            EngineEvent::MessagesHandled {
                partition_id,
                count,
                next_offset,
            } => {
                debug!(
                    partition_id = %partition_id,
                    count = %count,
                    next_offset = %next_offset,
                    "Messages handled"
                );
            }
            EngineEvent::PollFailed {
                kind,
                message,
                consecutive_failures,
            } => {
                error!(
                    kind = %kind,
                    failures = %consecutive_failures,
                    error = %message,
                    "Poll failed"
                );
            }
            EngineEvent::HandlerFailed { offset, message } => {
                error!(offset = %offset, error = %message, "Handler failed, position not advanced");
            }
            EngineEvent::PositionAdjusted {
                partition_id,
                adjustment,
            } => {
                warn!(
                    partition_id = %partition_id,
                    from = adjustment.requested,
                    to = adjustment.adjusted,
                    reason = ?adjustment.reason,
                    "Read position adjusted"
                );
            }
            EngineEvent::BatchDispatched {
                batch_id,
                count,
                partition_id,
                base_offset,
            } => {
                info!(
                    batch_id = %batch_id,
                    count = %count,
                    partition_id = %partition_id,
                    base_offset = %base_offset,
                    "Sent {} message(s)",
                    count
                );
            }
            EngineEvent::DispatchFailed {
                batch_id,
                count,
                kind,
                message,
            } => {
                error!(
                    batch_id = %batch_id,
                    count = %count,
                    kind = %kind,
                    error = %message,
                    "Batch dispatch failed"
                );
            }
            EngineEvent::LoopStopped { name, reason } => {
                info!(loop_name = %name, reason = %reason, "Loop stopped");
            }
        }
    }
}

/// Records events in memory, for tests and embedding applications.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching a predicate.
    pub fn count(&self, predicate: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    /// Recorded failure events (those carrying an error kind).
    pub fn failures(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.error_kind().is_some())
            .cloned()
            .collect()
    }

    /// Forget all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_fans_out() {
        let first = Arc::new(MemorySink::new());
        let second = Arc::new(MemorySink::new());
        let observer = Observer::tracing()
            .with_sink(first.clone())
            .with_sink(second.clone());

        observer.emit(EngineEvent::EmptyPoll {
            partition_id: 1,
            offset: 0,
        });

        assert_eq!(first.events().len(), 1);
        assert_eq!(second.events().len(), 1);
    }

    #[test]
    fn test_failure_events_carry_kind() {
        let sink = MemorySink::new();
        sink.emit(&EngineEvent::DispatchFailed {
            batch_id: 1,
            count: 10,
            kind: ErrorKind::Dispatch,
            message: "rejected".into(),
        });
        sink.emit(&EngineEvent::HandlerFailed {
            offset: 3,
            message: "bad".into(),
        });
        sink.emit(&EngineEvent::EmptyPoll {
            partition_id: 1,
            offset: 0,
        });

        let failures = sink.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].error_kind(), Some(ErrorKind::Dispatch));
        assert_eq!(failures[1].error_kind(), Some(ErrorKind::Handler));
        assert_eq!(failures[0].level(), EventLevel::Error);
    }

    #[test]
    fn test_stop_reason_level() {
        let stopped = EngineEvent::LoopStopped {
            name: "consume",
            reason: StopReason::Shutdown,
        };
        assert_eq!(stopped.level(), EventLevel::Info);

        let failed = EngineEvent::LoopStopped {
            name: "consume",
            reason: StopReason::Failed(ErrorKind::Poll),
        };
        assert_eq!(failed.level(), EventLevel::Info);
        assert_eq!(failed.error_kind(), None);
        assert_eq!(StopReason::Failed(ErrorKind::Poll).to_string(), "failed(poll)");
    }
}
