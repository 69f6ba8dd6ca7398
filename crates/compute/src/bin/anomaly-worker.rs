//! anomaly-worker: buffer-then-fit isolation forest over feature vectors.
//!
//! Consumes `FeatureVector` from `anomaly.input_topic` (default
//! `features-data`) and publishes an `AnomalyEvent` on
//! `anomaly.output_topic` (default `anomaly-events`) for every outlier once
//! the model is fitted. A failed fit exits non-zero so a supervisor can
//! restart the process with a fresh buffer.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use mantis_compute::service::{init_tracing, load_config, run_stage};
use mantis_compute::AnomalyStage;

/// Anomaly scorer stage of the machine-health pipeline.
#[derive(Parser, Debug)]
#[command(name = "anomaly-worker", version, about)]
struct Cli {
    /// Path to the pipeline TOML config.
    #[arg(long, env = "MANTIS_CONFIG", default_value = "config/mantis.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    config.log_summary();

    let settings = &config.anomaly;
    info!(
        buffer_capacity = settings.buffer_capacity,
        contamination = settings.contamination,
        scope = ?settings.scope,
        "anomaly scorer untrained, buffering first vectors"
    );

    run_stage(&config, settings.io(), AnomalyStage::from_config(settings)).await?;
    Ok(())
}
