use anyhow::{Context, Result, anyhow};
use bridge_core::config::load_config;
use bridge_core::errors::BridgeError;
use bridge_core::sink::Sink;
use bridge_core::sink::kafka::KafkaSink;
use bridge_core::source::pulsar::PulsarConnector;
use bridge_core::telemetry::init_tracing;
use bridge_core::{OutputRecord, SourceTask};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Entry point for running the bridge as a long-lived container job
/// (EKS, ECS and similar hosts).
///
/// Loads the runner config from the path given as first argument, or from
/// `BRIDGE_CONFIG`, then polls Pulsar and forwards every batch to Kafka until
/// Ctrl-C or a fatal error.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load runner config")?;
    config.validate()?;

    let sink = KafkaSink::new(&config.sink).context("Failed to create Kafka sink")?;
    let mut task = SourceTask::new(PulsarConnector);
    info!(version = task.version(), "Starting pulsar bridge");
    task.start(&config.task)
        .await
        .context("Failed to start source task")?;

    let shutdown = task.shutdown_handle();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        }
    });

    let outcome = run(&mut task, &sink, &shutdown).await;

    task.stop().await;
    if let Err(e) = sink.flush().await {
        warn!(error = %e, "Failed to flush Kafka sink on shutdown");
    }
    info!(metrics = ?task.metrics(), "Pulsar bridge stopped");
    outcome
}

async fn run(
    task: &mut SourceTask<PulsarConnector>,
    sink: &KafkaSink,
    shutdown: &CancellationToken,
) -> Result<()> {
    while !shutdown.is_cancelled() {
        let records = match task.poll().await {
            Ok(records) => records,
            Err(e) if e.is_retryable() => {
                backoff(&e, shutdown).await;
                continue;
            }
            Err(e) => {
                error!(error = %e, "Fatal source error, stopping");
                return Err(e.into());
            }
        };
        if !records.is_empty() {
            deliver(sink, &records, shutdown).await?;
        }
    }
    Ok(())
}

/// Writes `records` until the sink accepts them.
///
/// The batch is already acknowledged on the broker, so it is never dropped
/// for a retryable error. Fails on a fatal sink error, or when shutdown
/// arrives before the batch is written.
async fn deliver<S: Sink>(
    sink: &S,
    records: &[OutputRecord],
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        let e = match sink.write(records).await {
            Ok(()) => return Ok(()),
            Err(e) => BridgeError::from(e),
        };
        if !e.is_retryable() {
            error!(error = %e, records = records.len(), "Fatal sink error, stopping");
            return Err(e.into());
        }
        if shutdown.is_cancelled() {
            return Err(anyhow!(
                "shutdown before a batch of {} records was delivered: {e}",
                records.len()
            ));
        }
        backoff(&e, shutdown).await;
    }
}

async fn backoff(e: &BridgeError, shutdown: &CancellationToken) {
    let delay = e.get_retry_delay_ms();
    warn!(error = %e, delay_ms = delay, "Transient error, will retry");
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
    }
}
