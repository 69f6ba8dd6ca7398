//! feature-worker: reduces windowed sensor statistics to feature vectors.
//!
//! Consumes `WindowedStats` from `features.input_topic` (default
//! `preprocessed-data`) and publishes a `FeatureVector` per valid window on
//! `features.output_topic` (default `features-data`).

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use mantis_compute::service::{init_tracing, load_config, run_stage};
use mantis_compute::FeatureReducer;

/// Feature reducer stage of the machine-health pipeline.
#[derive(Parser, Debug)]
#[command(name = "feature-worker", version, about)]
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

    let mask = config.features.selection_mask()?;
    info!(selected = mask.len(), sensors = mask.sensor_count(), "sensor mask ready");

    run_stage(&config, config.features.io(), FeatureReducer::new(mask)).await?;
    Ok(())
}
