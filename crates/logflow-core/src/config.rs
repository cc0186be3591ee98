//! Configuration structures for logflow.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.

use crate::broker::Credentials;
use crate::consumer::DeliveryMode;
use crate::identifier::ResourceIdentifier;
use crate::model::{Consumer, Partitioning, PollingStrategy};
use crate::retry::{FailurePolicy, RetryConfig};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Stream and topic to provision
    pub resources: ResourcesConfig,

    /// Produce loop configuration
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Consume loop configuration
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Session establishment settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SessionConfig {
    /// Login username; no login is attempted without one
    pub username: Option<String>,

    /// Login password
    pub password: Option<String>,

    /// How long to wait for the broker to answer a ping after connecting
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Delay between ping attempts
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            ping_timeout_ms: default_ping_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

impl SessionConfig {
    /// Credentials to log in with, if configured.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        }
    }

    /// Ping timeout.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Stream and topic the loops work on.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ResourcesConfig {
    /// Stream name
    pub stream: String,

    /// Topic name
    pub topic: String,

    /// Partitions to create the topic with
    #[serde(default = "default_partitions_count")]
    pub partitions_count: u32,

    /// Replication factor to create the topic with
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u8,
}

impl ResourcesConfig {
    /// Resources with one partition and a replication factor of one.
    pub fn new(stream: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            topic: topic.into(),
            partitions_count: default_partitions_count(),
            replication_factor: default_replication_factor(),
        }
    }
}

/// How the producer chooses partitions, as written in config files.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitioningConfig {
    /// Spread batches across partitions
    Balanced,
    /// Send to one 1-based partition
    PartitionId { id: u32 },
    /// Hash a fixed key to a partition
    MessagesKey { key: String },
}

impl Default for PartitioningConfig {
    fn default() -> Self {
        PartitioningConfig::PartitionId {
            id: default_partition_id(),
        }
    }
}

impl PartitioningConfig {
    /// Partitioning passed to the broker.
    pub fn to_partitioning(&self) -> Partitioning {
        match self {
            PartitioningConfig::Balanced => Partitioning::Balanced,
            PartitioningConfig::PartitionId { id } => Partitioning::PartitionId(*id),
            PartitioningConfig::MessagesKey { key } => {
                Partitioning::messages_key(key.clone().into_bytes())
            }
        }
    }
}

/// Produce loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProducerConfig {
    /// Partition selection
    #[serde(default)]
    pub partitioning: PartitioningConfig,

    /// Messages per batch (upper bound)
    #[serde(default = "default_messages_per_batch")]
    pub messages_per_batch: u32,

    /// Sleep between batches in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Prefix of generated payloads (`{prefix}-{id}`)
    #[serde(default = "default_payload_prefix")]
    pub payload_prefix: String,

    /// What to do when a batch is rejected
    #[serde(default = "default_dispatch_policy")]
    pub on_dispatch_error: FailurePolicy,

    /// Stop after this many batches
    pub max_batches: Option<u64>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            partitioning: PartitioningConfig::default(),
            messages_per_batch: default_messages_per_batch(),
            interval_ms: default_interval_ms(),
            payload_prefix: default_payload_prefix(),
            on_dispatch_error: default_dispatch_policy(),
            max_batches: None,
        }
    }
}

impl ProducerConfig {
    /// Sleep between batches.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Backoff settings for retried polls.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetrySettings {
    /// Base delay in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Maximum consecutive retries
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Randomize delays by ±25%
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            max_retries: default_max_retries(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySettings {
    /// Build the backoff calculator.
    pub fn to_retry_config(&self) -> RetryConfig {
        let config = RetryConfig::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_retries,
        );
        if self.jitter {
            config
        } else {
            config.without_jitter()
        }
    }
}

/// Consume loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ConsumerConfig {
    /// Identity the read position is tracked under
    #[serde(default)]
    pub identity: Consumer,

    /// 1-based partition to read
    #[serde(default = "default_partition_id")]
    pub partition_id: u32,

    /// Where the first poll starts
    #[serde(default)]
    pub strategy: PollingStrategy,

    /// Messages per poll
    #[serde(default = "default_messages_per_poll")]
    pub messages_per_poll: u32,

    /// Let the broker store the read position
    #[serde(default)]
    pub auto_commit: bool,

    /// Sleep between polls in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Per message or per batch delivery
    #[serde(default)]
    pub delivery: DeliveryMode,

    /// What to do when a poll fails
    #[serde(default = "default_terminate_policy")]
    pub on_poll_error: FailurePolicy,

    /// What to do when the handler fails
    #[serde(default = "default_terminate_policy")]
    pub on_handler_error: FailurePolicy,

    /// Backoff between retried polls
    #[serde(default)]
    pub retry: RetrySettings,

    /// Stop after this many polls
    pub max_cycles: Option<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            identity: Consumer::default(),
            partition_id: default_partition_id(),
            strategy: PollingStrategy::default(),
            messages_per_poll: default_messages_per_poll(),
            auto_commit: false,
            interval_ms: default_interval_ms(),
            delivery: DeliveryMode::default(),
            on_poll_error: default_terminate_policy(),
            on_handler_error: default_terminate_policy(),
            retry: RetrySettings::default(),
            max_cycles: None,
        }
    }
}

impl ConsumerConfig {
    /// Sleep between polls.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Prefix of exported metric names
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            metrics_prefix: default_metrics_prefix(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive usable in an `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Plain text format (default)
    #[default]
    Text,
}

// Default value functions
fn default_ping_timeout_ms() -> u64 {
    5_000
}
fn default_ping_interval_ms() -> u64 {
    100
}
fn default_partitions_count() -> u32 {
    1
}
fn default_replication_factor() -> u8 {
    1
}
fn default_partition_id() -> u32 {
    1
}
fn default_messages_per_batch() -> u32 {
    10
}
fn default_messages_per_poll() -> u32 {
    10
}
fn default_interval_ms() -> u64 {
    500
}
fn default_payload_prefix() -> String {
    "message".into()
}
fn default_dispatch_policy() -> FailurePolicy {
    FailurePolicy::Continue
}
fn default_terminate_policy() -> FailurePolicy {
    FailurePolicy::Terminate
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    10
}
fn default_jitter() -> bool {
    true
}
fn default_metrics_prefix() -> String {
    "logflow".into()
}

impl Config {
    /// Configuration for the given resources with every other section
    /// at its defaults.
    pub fn new(resources: ResourcesConfig) -> Self {
        Self {
            session: SessionConfig::default(),
            resources,
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }

    /// Load and validate configuration from a file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        ResourceIdentifier::named(self.resources.stream.as_str())
            .map_err(|e| Error::Config(format!("Invalid stream name: {}", e)))?;
        ResourceIdentifier::named(self.resources.topic.as_str())
            .map_err(|e| Error::Config(format!("Invalid topic name: {}", e)))?;

        if self.resources.partitions_count == 0 {
            return Err(Error::Config("partitions_count must be at least 1".into()));
        }

        if self.resources.replication_factor == 0 {
            return Err(Error::Config(
                "replication_factor must be at least 1".into(),
            ));
        }

        if self.session.username.is_some() != self.session.password.is_some() {
            return Err(Error::Config(
                "username and password must be set together".into(),
            ));
        }

        if self.session.ping_interval_ms == 0 {
            return Err(Error::Config("ping_interval_ms must be positive".into()));
        }

        if self.producer.messages_per_batch == 0 {
            return Err(Error::Config(
                "messages_per_batch must be at least 1".into(),
            ));
        }

        if let PartitioningConfig::PartitionId { id } = self.producer.partitioning {
            self.check_partition("producer", id)?;
        }

        if let PartitioningConfig::MessagesKey { key } = &self.producer.partitioning {
            if key.is_empty() {
                return Err(Error::Config("messages key cannot be empty".into()));
            }
        }

        if self.producer.max_batches == Some(0) {
            return Err(Error::Config("max_batches must be at least 1".into()));
        }

        self.consumer
            .identity
            .id
            .validate()
            .map_err(|e| Error::Config(format!("Invalid consumer id: {}", e)))?;

        self.check_partition("consumer", self.consumer.partition_id)?;

        if self.consumer.messages_per_poll == 0 {
            return Err(Error::Config("messages_per_poll must be at least 1".into()));
        }

        if self.consumer.max_cycles == Some(0) {
            return Err(Error::Config("max_cycles must be at least 1".into()));
        }

        if self.consumer.retry.base_delay_ms > self.consumer.retry.max_delay_ms {
            tracing::warn!(
                base_delay_ms = self.consumer.retry.base_delay_ms,
                max_delay_ms = self.consumer.retry.max_delay_ms,
                "Retry base delay exceeds max delay, every retry waits max_delay_ms"
            );
        }

        Ok(())
    }

    fn check_partition(&self, section: &str, partition_id: u32) -> Result<()> {
        if partition_id == 0 || partition_id > self.resources.partitions_count {
            return Err(Error::Config(format!(
                "{} partition_id {} outside 1..={}",
                section, partition_id, self.resources.partitions_count
            )));
        }
        Ok(())
    }
}
