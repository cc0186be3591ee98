//! Engine metrics with Prometheus text export.

use crate::events::{EngineEvent, EventSink};
use crate::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters and gauges fed by engine events.
pub struct EngineMetrics {
    // === COUNTERS ===
    /// Messages accepted by the broker
    messages_sent_total: AtomicU64,

    /// Batches accepted by the broker
    batches_sent_total: AtomicU64,

    /// Batches rejected or not sent
    dispatch_failures_total: AtomicU64,

    /// Messages fully processed by the handler
    messages_consumed_total: AtomicU64,

    /// Polls that returned nothing
    empty_polls_total: AtomicU64,

    /// Failed polls
    poll_failures_total: AtomicU64,

    /// Handler failures
    handler_failures_total: AtomicU64,

    /// Read position adjustments
    position_adjustments_total: AtomicU64,

    /// Errors by kind, indexed like `ErrorKind::ALL`
    errors_by_kind: [AtomicU64; ErrorKind::ALL.len()],

    // === GAUGES ===
    /// Next offset the consume loop will read
    consumer_position: AtomicU64,
}

impl EngineMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            messages_sent_total: AtomicU64::new(0),
            batches_sent_total: AtomicU64::new(0),
            dispatch_failures_total: AtomicU64::new(0),
            messages_consumed_total: AtomicU64::new(0),
            empty_polls_total: AtomicU64::new(0),
            poll_failures_total: AtomicU64::new(0),
            handler_failures_total: AtomicU64::new(0),
            position_adjustments_total: AtomicU64::new(0),
            errors_by_kind: std::array::from_fn(|_| AtomicU64::new(0)),
            consumer_position: AtomicU64::new(0),
        }
    }

    fn kind_index(kind: ErrorKind) -> usize {
        ErrorKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(ErrorKind::ALL.len() - 1)
    }

    /// Record an error of the given kind.
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors_by_kind[Self::kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    /// Messages accepted by the broker.
    pub fn messages_sent_total(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Batches accepted by the broker.
    pub fn batches_sent_total(&self) -> u64 {
        self.batches_sent_total.load(Ordering::Relaxed)
    }

    /// Batches rejected or not sent.
    pub fn dispatch_failures_total(&self) -> u64 {
        self.dispatch_failures_total.load(Ordering::Relaxed)
    }

    /// Messages fully processed by the handler.
    pub fn messages_consumed_total(&self) -> u64 {
        self.messages_consumed_total.load(Ordering::Relaxed)
    }

    /// Polls that returned nothing.
    pub fn empty_polls_total(&self) -> u64 {
        self.empty_polls_total.load(Ordering::Relaxed)
    }

    /// Failed polls.
    pub fn poll_failures_total(&self) -> u64 {
        self.poll_failures_total.load(Ordering::Relaxed)
    }

    /// Handler failures.
    pub fn handler_failures_total(&self) -> u64 {
        self.handler_failures_total.load(Ordering::Relaxed)
    }

    /// Read position adjustments.
    pub fn position_adjustments_total(&self) -> u64 {
        self.position_adjustments_total.load(Ordering::Relaxed)
    }

    /// Errors recorded for one kind.
    pub fn errors_by_kind(&self, kind: ErrorKind) -> u64 {
        self.errors_by_kind[Self::kind_index(kind)].load(Ordering::Relaxed)
    }

    /// Errors recorded across all kinds.
    pub fn errors_total(&self) -> u64 {
        self.errors_by_kind
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Next offset the consume loop will read.
    pub fn consumer_position(&self) -> u64 {
        self.consumer_position.load(Ordering::Relaxed)
    }

    /// Export metrics in Prometheus text exposition format.
    pub fn export_prometheus_text(&self) -> String {
        self.export_prometheus_text_with_prefix("logflow")
    }

    /// Export metrics with a custom metric name prefix.
    pub fn export_prometheus_text_with_prefix(&self, prefix: &str) -> String {
        let mut output = String::new();

        let counters = [
            (
                "messages_sent_total",
                "Messages accepted by the broker",
                self.messages_sent_total(),
            ),
            (
                "batches_sent_total",
                "Batches accepted by the broker",
                self.batches_sent_total(),
            ),
            (
                "dispatch_failures_total",
                "Batches rejected or not sent",
                self.dispatch_failures_total(),
            ),
            (
                "messages_consumed_total",
                "Messages fully processed by the handler",
                self.messages_consumed_total(),
            ),
            (
                "empty_polls_total",
                "Polls that returned no messages",
                self.empty_polls_total(),
            ),
            (
                "poll_failures_total",
                "Failed polls",
                self.poll_failures_total(),
            ),
            (
                "handler_failures_total",
                "Handler failures",
                self.handler_failures_total(),
            ),
            (
                "position_adjustments_total",
                "Read position adjustments",
                self.position_adjustments_total(),
            ),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {}_{} {}\n", prefix, name, help));
            output.push_str(&format!("# TYPE {}_{} counter\n", prefix, name));
            output.push_str(&format!("{}_{} {}\n", prefix, name, value));
            output.push('\n');
        }

        output.push_str(&format!(
            "# HELP {}_errors_total Errors by kind\n",
            prefix
        ));
        output.push_str(&format!("# TYPE {}_errors_total counter\n", prefix));
        for kind in ErrorKind::ALL {
            output.push_str(&format!(
                "{}_errors_total{{kind=\"{}\"}} {}\n",
                prefix,
                kind.as_label(),
                self.errors_by_kind(kind)
            ));
        }
        output.push('\n');

        output.push_str(&format!(
            "# HELP {}_consumer_position Next offset the consumer will read\n",
            prefix
        ));
        output.push_str(&format!("# TYPE {}_consumer_position gauge\n", prefix));
        output.push_str(&format!(
            "{}_consumer_position {}\n",
            prefix,
            self.consumer_position()
        ));

        output
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EngineMetrics {
    fn emit(&self, event: &EngineEvent) {
        if let Some(kind) = event.error_kind() {
            self.record_error(kind);
        }

        match event {
            EngineEvent::BatchDispatched { count, .. } => {
                self.batches_sent_total.fetch_add(1, Ordering::Relaxed);
                self.messages_sent_total
                    .fetch_add(*count as u64, Ordering::Relaxed);
            }
            EngineEvent::DispatchFailed { .. } => {
                self.dispatch_failures_total.fetch_add(1, Ordering::Relaxed);
            }
            EngineEvent::MessagesHandled {
                count, next_offset, ..
            } => {
                self.messages_consumed_total
                    .fetch_add(*count as u64, Ordering::Relaxed);
                self.consumer_position.store(*next_offset, Ordering::Relaxed);
            }
            EngineEvent::EmptyPoll { offset, .. } => {
                self.empty_polls_total.fetch_add(1, Ordering::Relaxed);
                self.consumer_position.store(*offset, Ordering::Relaxed);
            }
            EngineEvent::PollFailed { .. } => {
                self.poll_failures_total.fetch_add(1, Ordering::Relaxed);
            }
            EngineEvent::HandlerFailed { .. } => {
                self.handler_failures_total.fetch_add(1, Ordering::Relaxed);
            }
            EngineEvent::PositionAdjusted { adjustment, .. } => {
                self.position_adjustments_total
                    .fetch_add(1, Ordering::Relaxed);
                self.consumer_position
                    .store(adjustment.adjusted, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{AdjustmentReason, PositionAdjustment};

    #[test]
    fn test_counters_from_events() {
        let metrics = EngineMetrics::new();

        metrics.emit(&EngineEvent::BatchDispatched {
            batch_id: 1,
            count: 10,
            partition_id: 1,
            base_offset: 0,
        });
        metrics.emit(&EngineEvent::DispatchFailed {
            batch_id: 2,
            count: 10,
            kind: ErrorKind::Dispatch,
            message: "rejected".into(),
        });
        metrics.emit(&EngineEvent::MessagesHandled {
            partition_id: 1,
            count: 10,
            next_offset: 10,
        });
        metrics.emit(&EngineEvent::EmptyPoll {
            partition_id: 1,
            offset: 10,
        });

        assert_eq!(metrics.batches_sent_total(), 1);
        assert_eq!(metrics.messages_sent_total(), 10);
        assert_eq!(metrics.dispatch_failures_total(), 1);
        assert_eq!(metrics.messages_consumed_total(), 10);
        assert_eq!(metrics.empty_polls_total(), 1);
        assert_eq!(metrics.consumer_position(), 10);
        assert_eq!(metrics.errors_by_kind(ErrorKind::Dispatch), 1);
        assert_eq!(metrics.errors_total(), 1);
    }

    #[test]
    fn test_position_adjustment_updates_gauge() {
        let metrics = EngineMetrics::new();
        metrics.emit(&EngineEvent::PositionAdjusted {
            partition_id: 1,
            adjustment: PositionAdjustment {
                requested: 2,
                adjusted: 5,
                reason: AdjustmentReason::BelowLowWaterMark,
            },
        });
        assert_eq!(metrics.position_adjustments_total(), 1);
        assert_eq!(metrics.consumer_position(), 5);
    }

    #[test]
    fn test_prometheus_text_export() {
        let metrics = EngineMetrics::new();
        metrics.emit(&EngineEvent::PollFailed {
            kind: ErrorKind::Poll,
            message: "timeout".into(),
            consecutive_failures: 1,
        });

        let text = metrics.export_prometheus_text();
        assert!(text.contains("# TYPE logflow_messages_sent_total counter"));
        assert!(text.contains("logflow_poll_failures_total 1"));
        assert!(text.contains("logflow_errors_total{kind=\"poll\"} 1"));
        assert!(text.contains("# TYPE logflow_consumer_position gauge"));

        let custom = metrics.export_prometheus_text_with_prefix("app");
        assert!(custom.contains("app_poll_failures_total 1"));
        assert!(!custom.contains("logflow_"));
    }
}
