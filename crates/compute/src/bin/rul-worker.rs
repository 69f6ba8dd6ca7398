//! rul-worker: remaining-useful-life regression over feature vectors.
//!
//! Consumes `FeatureVector` from `rul.input_topic` (default `features-data`)
//! and publishes one `RulPrediction` per vector with advanced features on
//! `rul.output_topic` (default `rul-predictions`). Runs on random weights,
//! reported as degraded, when `rul.model_path` does not exist.

use std::path::PathBuf;

use clap::Parser;

use mantis_compute::service::{init_tracing, load_config, run_stage};
use mantis_compute::RulPredictor;

/// RUL predictor stage of the machine-health pipeline.
#[derive(Parser, Debug)]
#[command(name = "rul-worker", version, about)]
struct Cli {
    /// Path to the pipeline TOML config.
    #[arg(long, env = "MANTIS_CONFIG", default_value = "config/mantis.toml")]
    config: PathBuf,

    /// Overrides `rul.model_path`.
    #[arg(long)]
    model: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(model) = cli.model {
        config.rul.model_path = model;
    }
    config.log_summary();

    let predictor = RulPredictor::from_config(&config.rul)?;
    run_stage(&config, config.rul.io(), predictor).await?;
    Ok(())
}
