//! mantis-broker: PUB/SUB proxy connecting the pipeline stages.
//!
//! # Usage
//!
//! ```bash
//! # Local IPC sockets under /tmp/mantis (default)
//! mantis-broker
//!
//! # TCP
//! mantis-broker --frontend tcp://0.0.0.0:5555 --backend tcp://0.0.0.0:5556 --health tcp://0.0.0.0:5557
//!
//! # Via environment variables
//! MANTIS_BROKER_FRONTEND=tcp://0.0.0.0:5555 MANTIS_BROKER_BACKEND=tcp://0.0.0.0:5556 mantis-broker
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mantis_bus::broker::{BrokerConfig, EventBroker};
use mantis_bus::shutdown_signal;

/// PUB/SUB broker for the machine-health pipeline.
#[derive(Parser, Debug)]
#[command(name = "mantis-broker", version, about)]
struct Cli {
    /// Endpoint publishers connect to.
    #[arg(long, env = "MANTIS_BROKER_FRONTEND", default_value = "ipc:///tmp/mantis/broker-frontend.sock")]
    frontend: String,

    /// Endpoint subscribers connect to.
    #[arg(long, env = "MANTIS_BROKER_BACKEND", default_value = "ipc:///tmp/mantis/broker-backend.sock")]
    backend: String,

    /// Endpoint answering liveness probes.
    #[arg(long, env = "MANTIS_BROKER_HEALTH", default_value = "ipc:///tmp/mantis/broker-health.sock")]
    health: String,

    /// HTTP port for the `/metrics` JSON endpoint (0 = disabled).
    #[arg(long, env = "MANTIS_BROKER_METRICS_PORT", default_value_t = 0)]
    metrics_port: u16,

    /// Seconds between throughput log lines (0 = disabled).
    #[arg(long, env = "MANTIS_BROKER_METRICS_INTERVAL", default_value_t = 30)]
    metrics_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting mantis-broker");

    let mut config = BrokerConfig::from_endpoints(&cli.frontend, &cli.backend, &cli.health)?;
    config.metrics_port = (cli.metrics_port > 0).then_some(cli.metrics_port);
    let broker = Arc::new(EventBroker::new(config));

    let broker_for_signal = broker.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        broker_for_signal.shutdown();
    });

    if cli.metrics_interval > 0 {
        let metrics = broker.metrics().clone();
        let every = Duration::from_secs(cli.metrics_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let snap = metrics.snapshot().await;
                tracing::info!(
                    total_messages = snap.total_messages,
                    topics = snap.topics.len(),
                    workers = snap.workers.len(),
                    "broker traffic"
                );
                for (topic, traffic) in &snap.topics {
                    tracing::debug!(topic = %topic, messages = traffic.messages, bytes = traffic.bytes, "topic traffic");
                }
            }
        });
    }

    broker.run().await?;

    tracing::info!("mantis-broker exited cleanly");
    Ok(())
}
