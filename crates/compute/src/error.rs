use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while fitting, loading or evaluating a model.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("need at least 2 samples to fit, got {got}")]
    NotEnoughSamples { got: usize },

    #[error("width mismatch: expected {expected} features, got {got}")]
    WidthMismatch { expected: usize, got: usize },

    #[error("non-finite value in row {row}")]
    NonFinite { row: usize },

    #[error("invalid model input: {0}")]
    InvalidInput(String),

    #[error("cannot access model artifact {}: {source}", .path.display())]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model artifact {} is not a valid regressor: {source}", .path.display())]
    ArtifactFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("inconsistent model shapes: {0}")]
    Shape(String),
}

/// Outcome of a failed `Stage::process` call.
#[derive(Error, Debug)]
pub enum StageError {
    /// Bad input. The message is dropped and the loop continues.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// The stage can no longer produce correct output.
    #[error("model fit failed: {0}")]
    ModelFit(#[source] ModelError),
}

impl StageError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::ModelFit(_))
    }
}

/// Why a stage process ended unsuccessfully.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Bus(#[from] mantis_bus::BusError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("stage loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
