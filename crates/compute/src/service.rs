//! Process wiring shared by `feature-worker`, `anomaly-worker` and `rul-worker`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use mantis_bus::metrics::spawn_stage_metrics_server;
use mantis_bus::{
    retry, RetryPolicy, StageMetrics, Transport, Worker, WorkerBuilder, WorkerRunner, ZmqPublisher,
    ZmqSubscriber,
};
use mantis_core::config::StageIo;
use mantis_core::MantisConfig;

use crate::error::ServiceError;
use crate::pipeline::Stage;
use crate::runner::StageWorker;

/// `tracing` to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Load configuration. A missing file means defaults; a file that exists
/// but does not parse or validate is a startup error.
pub fn load_config(path: &Path) -> Result<MantisConfig, mantis_core::MantisError> {
    MantisConfig::load(path).inspect_err(|e| {
        error!(error = %e, path = %path.display(), "invalid configuration");
    })
}

/// Connect to the broker, run `stage` until shutdown and report how it ended.
///
/// Startup problems (broker unreachable after bounded retries) and fatal stage
/// errors are returned; a clean signal-driven stop is `Ok`.
pub async fn run_stage<S: Stage>(config: &MantisConfig, io: StageIo, stage: S) -> Result<(), ServiceError> {
    let connect_policy = RetryPolicy::new(
        config.broker.connect_attempts,
        Duration::from_millis(config.broker.connect_backoff_ms),
    );
    let frontend = Transport::parse(&config.broker.frontend)?;
    let backend = Transport::parse(&config.broker.backend)?;

    let publisher = Arc::new(
        retry("connect publisher", &connect_policy, || ZmqPublisher::connect(&frontend)).await?,
    );
    let subscriber = Arc::new(
        retry("connect subscriber", &connect_policy, || ZmqSubscriber::connect(&backend)).await?,
    );

    let metrics = StageMetrics::new(io.name);
    let (http_shutdown, http_rx) = watch::channel(false);
    if io.metrics_port > 0 {
        spawn_stage_metrics_server(io.metrics_port, metrics.clone(), http_rx);
    }

    let worker = StageWorker::new(io.clone(), subscriber, metrics);
    // subscribe before the loop takes the socket
    worker.start().await?;

    let publish_policy = RetryPolicy::new(
        config.runtime.publish_attempts,
        Duration::from_millis(config.runtime.publish_backoff_ms),
    );
    let stage_loop = worker.stage_loop(stage, publisher.clone(), publish_policy);
    let shutdown = Arc::new(Notify::new());
    let loop_handle = tokio::spawn(stage_loop.run(Some(shutdown.clone())));

    let shutdown_timeout = Duration::from_secs(config.runtime.shutdown_timeout_secs);
    let runner_config = WorkerBuilder::new(io.group_id.clone())
        .health_interval(Duration::from_secs(config.runtime.health_interval_secs))
        .shutdown_timeout(shutdown_timeout)
        .build();

    info!(stage = io.name, group = %io.group_id, "stage starting");
    WorkerRunner::run(worker, publisher, runner_config, Some(shutdown)).await?;

    let _ = http_shutdown.send(true);

    match tokio::time::timeout(shutdown_timeout, loop_handle).await {
        Ok(joined) => joined??,
        Err(_) => warn!(stage = io.name, "stage loop did not finish within the shutdown timeout"),
    }
    info!(stage = io.name, "stage exited cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.anomaly.buffer_capacity, 100);
    }

    #[test]
    fn existing_but_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mantis.toml");

        std::fs::write(&path, "[anomaly]\nbuffer_capacity = 20\ncontamination = 0.9\n").unwrap();
        assert!(load_config(&path).is_err());

        std::fs::write(&path, "[anomaly\nbuffer_capacity = 20\n").unwrap();
        assert!(load_config(&path).is_err());

        std::fs::write(&path, "[anomaly]\nbuffer_capacity = 20\n").unwrap();
        assert_eq!(load_config(&path).unwrap().anomaly.buffer_capacity, 20);
    }
}
