//! Validate command implementation.

use anyhow::Result;
use logflow_core::Config;

/// Validate a loaded configuration and print what it resolves to.
pub fn run(config: &Config) -> Result<()> {
    config.validate()?;

    println!("Configuration is valid");
    println!(
        "  resources: {}/{} ({} partition(s), replication {})",
        config.resources.stream,
        config.resources.topic,
        config.resources.partitions_count,
        config.resources.replication_factor
    );
    println!(
        "  producer:  {} message(s) per batch to {} every {} ms",
        config.producer.messages_per_batch,
        config.producer.partitioning.to_partitioning(),
        config.producer.interval_ms
    );
    println!(
        "  consumer:  {} on partition {} from {} every {} ms",
        config.consumer.identity,
        config.consumer.partition_id,
        config.consumer.strategy,
        config.consumer.interval_ms
    );
    Ok(())
}
