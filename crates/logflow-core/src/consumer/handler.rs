//! Message handler callback.

use crate::model::InboundMessage;
use crate::BoxError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// How polled messages are handed to the handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// One `handle` call per message, in offset order
    #[default]
    PerMessage,
    /// One `handle_batch` call per poll
    Batch,
}

/// Processes consumed messages.
///
/// A failure stops delivery of the remaining messages of the poll and
/// leaves the read position where it was, so the messages are delivered
/// again on the next cycle.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    async fn handle(&self, message: &InboundMessage) -> Result<(), BoxError>;

    /// Process every message of a poll, in ascending offset order.
    async fn handle_batch(&self, messages: &[InboundMessage]) -> Result<(), BoxError> {
        for message in messages {
            self.handle(message).await?;
        }
        Ok(())
    }
}

/// Handler backed by a closure.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&InboundMessage) -> Result<(), BoxError> + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&InboundMessage) -> Result<(), BoxError> + Send + Sync,
{
    async fn handle(&self, message: &InboundMessage) -> Result<(), BoxError> {
        (self.f)(message)
    }
}

/// Logs each message's offset and payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<(), BoxError> {
        info!(
            offset = message.offset,
            payload = %String::from_utf8_lossy(&message.payload),
            timestamp = %message.timestamp,
            "Handling message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn message(offset: u64) -> InboundMessage {
        InboundMessage {
            offset,
            payload: Bytes::from(format!("message-{}", offset + 1)),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_default_batch_stops_at_first_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let handler = FnHandler::new(move |m: &InboundMessage| {
            if m.offset == 2 {
                return Err("bad payload".into());
            }
            recorder.lock().push(m.offset);
            Ok(())
        });

        let messages: Vec<_> = (0..5).map(message).collect();
        let result = handler.handle_batch(&messages).await;

        assert!(result.is_err());
        assert_eq!(*seen.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_everything() {
        let handler = LoggingHandler;
        let messages: Vec<_> = (0..3).map(message).collect();
        assert!(handler.handle_batch(&messages).await.is_ok());
    }

    #[test]
    fn test_delivery_mode_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            delivery: DeliveryMode,
        }
        let parsed: Wrapper = toml::from_str("delivery = \"batch\"").unwrap();
        assert_eq!(parsed.delivery, DeliveryMode::Batch);
        let parsed: Wrapper = toml::from_str("delivery = \"per_message\"").unwrap();
        assert_eq!(parsed.delivery, DeliveryMode::PerMessage);
    }
}
