//! Idempotent stream and topic provisioning.
//!
//! Resources are looked up first and created only when the lookup reports
//! them missing. A failed lookup is an error in its own right and never
//! leads to a create call.

use crate::broker::BrokerClient;
use crate::config::ResourcesConfig;
use crate::events::{EngineEvent, Observer};
use crate::identifier::ResourceIdentifier;
use crate::model::{StreamDescriptor, TopicDescriptor};
use crate::{Error, ErrorKind, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Stream and topic the loops work on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedResources {
    pub stream: StreamDescriptor,
    pub topic: TopicDescriptor,
}

impl ProvisionedResources {
    /// Identifier of the stream.
    pub fn stream_id(&self) -> ResourceIdentifier {
        self.stream.identifier()
    }

    /// Identifier of the topic.
    pub fn topic_id(&self) -> ResourceIdentifier {
        self.topic.identifier()
    }
}

/// Finds or creates streams and topics.
pub struct ResourceProvisioner {
    client: Arc<dyn BrokerClient>,
    observer: Observer,
}

impl ResourceProvisioner {
    /// Create a provisioner.
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self {
            client,
            observer: Observer::tracing(),
        }
    }

    /// Report events to `observer` instead of the default tracing sink.
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    /// Provision the configured stream and topic.
    pub async fn provision(&self, resources: &ResourcesConfig) -> Result<ProvisionedResources> {
        let stream = self.ensure_stream(&resources.stream).await?;
        let topic = self
            .ensure_topic(
                &stream.identifier(),
                &resources.topic,
                resources.partitions_count,
                resources.replication_factor,
            )
            .await?;
        Ok(ProvisionedResources { stream, topic })
    }

    /// Get or create a stream by name.
    pub async fn ensure_stream(&self, name: &str) -> Result<StreamDescriptor> {
        let resource = format!("stream {}", name);
        let result = self.get_or_create_stream(&resource, name).await;
        self.report(&resource, result)
            .map(|(stream, created)| {
                self.observer.emit(EngineEvent::StreamReady {
                    stream: stream.clone(),
                    created,
                });
                stream
            })
    }

    /// Get or create a topic by name within `stream`.
    ///
    /// An existing topic is returned as is, even when its partition count or
    /// replication factor differ from the requested ones.
    pub async fn ensure_topic(
        &self,
        stream: &ResourceIdentifier,
        name: &str,
        partitions_count: u32,
        replication_factor: u8,
    ) -> Result<TopicDescriptor> {
        let resource = format!("topic {}", name);
        let result = self
            .get_or_create_topic(&resource, stream, name, partitions_count, replication_factor)
            .await;
        let (topic, created) = self.report(&resource, result)?;

        self.observer.emit(EngineEvent::TopicReady {
            stream: stream.clone(),
            topic: topic.clone(),
            created,
        });
        Ok(topic)
    }

    async fn get_or_create_stream(
        &self,
        resource: &str,
        name: &str,
    ) -> Result<(StreamDescriptor, bool)> {
        let id = ResourceIdentifier::named(name)?;

        let existing = self
            .client
            .get_stream(&id)
            .await
            .map_err(|e| lookup_error(resource, e))?;
        if let Some(stream) = existing {
            return Ok((stream, false));
        }

        info!(stream = %name, "Stream does not exist, creating");
        let stream = self.client.create_stream(name).await?;
        Ok((stream, true))
    }

    async fn get_or_create_topic(
        &self,
        resource: &str,
        stream: &ResourceIdentifier,
        name: &str,
        partitions_count: u32,
        replication_factor: u8,
    ) -> Result<(TopicDescriptor, bool)> {
        let id = ResourceIdentifier::named(name)?;
        if partitions_count == 0 || replication_factor == 0 {
            return Err(Error::Config(
                "partitions_count and replication_factor must be at least 1".into(),
            ));
        }

        let existing = self
            .client
            .get_topic(stream, &id)
            .await
            .map_err(|e| lookup_error(resource, e))?;
        if let Some(topic) = existing {
            if topic.partitions_count != partitions_count
                || topic.replication_factor != replication_factor
            {
                warn!(
                    topic = %name,
                    partitions = topic.partitions_count,
                    requested_partitions = partitions_count,
                    replication_factor = topic.replication_factor,
                    requested_replication_factor = replication_factor,
                    "Existing topic differs from the requested layout, using it unchanged"
                );
            }
            return Ok((topic, false));
        }

        info!(
            stream = %stream,
            topic = %name,
            partitions = partitions_count,
            "Topic does not exist, creating"
        );
        let topic = self
            .client
            .create_topic(stream, name, partitions_count, replication_factor)
            .await?;
        Ok((topic, true))
    }

    /// Emit one failure event for a failed provisioning step.
    fn report<T>(&self, resource: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.observer.emit(EngineEvent::ProvisioningFailed {
                resource: resource.to_string(),
                kind: e.kind(),
                message: e.to_string(),
            });
        }
        result
    }
}

/// Session failures keep their kind; anything else becomes a lookup error.
fn lookup_error(resource: &str, error: Error) -> Error {
    match error.kind() {
        ErrorKind::Connection | ErrorKind::Auth | ErrorKind::ResourceLookup => error,
        _ => Error::ResourceLookup {
            resource: resource.to_string(),
            message: error.to_string(),
        },
    }
}
