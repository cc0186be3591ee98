//! Run command implementation.

use anyhow::{Context, Result};
use logflow_core::broker::{BrokerClient, InMemoryBroker};
use logflow_core::consumer::{ConsumeLoop, LoggingHandler};
use logflow_core::events::Observer;
use logflow_core::metrics::EngineMetrics;
use logflow_core::producer::{BatchProducer, ProduceLoop};
use logflow_core::provisioner::ResourceProvisioner;
use logflow_core::session::Session;
use logflow_core::Config;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Open a session, provision the stream and topic, then run the produce
/// and consume loops side by side until both stop.
pub async fn run(mut config: Config, batches: Option<u64>, cycles: Option<u64>) -> Result<()> {
    // Apply CLI overrides
    if let Some(batches) = batches {
        config.producer.max_batches = Some(batches);
    }
    if let Some(cycles) = cycles {
        config.consumer.max_cycles = Some(cycles);
    }
    config.validate()?;

    info!(
        stream = %config.resources.stream,
        topic = %config.resources.topic,
        partitions = config.resources.partitions_count,
        "Starting logflow"
    );

    let broker: Arc<dyn BrokerClient> = match config.session.credentials() {
        Some(credentials) => Arc::new(InMemoryBroker::with_credentials(credentials)),
        None => Arc::new(InMemoryBroker::new()),
    };
    let metrics = Arc::new(EngineMetrics::new());
    let observer = Observer::tracing().with_sink(metrics.clone());

    let session = Session::open_observed(broker, &config.session, &observer)
        .await
        .context("failed to open broker session")?;

    let resources = ResourceProvisioner::new(session.client())
        .with_observer(observer.clone())
        .provision(&config.resources)
        .await?;

    let producer = BatchProducer::new(
        session.client(),
        resources.stream_id(),
        resources.topic_id(),
        config.producer.messages_per_batch,
    )
    .with_observer(observer.clone());
    let mut produce =
        ProduceLoop::new(producer, config.producer.clone()).with_observer(observer.clone());

    let mut consume = ConsumeLoop::new(
        session.client(),
        resources.stream_id(),
        resources.topic_id(),
        config.consumer.clone(),
        Arc::new(LoggingHandler),
    )
    .with_observer(observer);

    let stop_producer = produce.shutdown_signal();
    let stop_consumer = consume.shutdown_signal();
    spawn_signal_handler(vec![stop_producer.clone(), stop_consumer.clone()]);

    // A loop that stops on a failure takes the other one down with it
    let (produced, consumed) = tokio::join!(
        async {
            let result = produce.run().await;
            if result.is_err() {
                let _ = stop_consumer.send(());
            }
            result
        },
        async {
            let result = consume.run().await;
            if result.is_err() {
                let _ = stop_producer.send(());
            }
            result
        },
    );

    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close session");
    }

    print!(
        "{}",
        metrics.export_prometheus_text_with_prefix(&config.monitoring.metrics_prefix)
    );

    let produced = produced.context("produce loop stopped")?;
    let consumed = consumed.context("consume loop stopped")?;
    info!(
        batches_sent = produced.batches_sent,
        messages_sent = produced.messages_sent,
        messages_handled = consumed.messages_handled,
        position = consumed.position,
        "logflow stopped"
    );
    Ok(())
}

/// Forward SIGINT and SIGTERM to every loop's shutdown signal.
fn spawn_signal_handler(targets: Vec<broadcast::Sender<()>>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, initiating graceful shutdown");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        for target in targets {
            let _ = target.send(());
        }
    });
}
