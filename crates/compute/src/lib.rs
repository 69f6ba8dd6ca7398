pub mod algorithms;
pub mod error;
pub mod pipeline;
pub mod runner;
pub mod service;

pub use error::{ModelError, ServiceError, StageError};
pub use pipeline::{AnomalyStage, FeatureReducer, RulPredictor, Stage};
pub use runner::{StageLoop, StageWorker};
