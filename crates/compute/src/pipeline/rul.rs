//! Remaining-useful-life regression.

use std::path::Path;

use tracing::{debug, info, warn};

use mantis_core::config::RulStageConfig;
use mantis_core::{FeatureVector, RulPrediction};

use super::Stage;
use crate::algorithms::lstm::LstmRegressor;
use crate::error::{ModelError, StageError};

/// Descriptor count the regressor consumes: skewness, kurtosis, energy, avg_snr.
pub const INPUT_WIDTH: usize = 4;

/// Owns a read-only regressor for the life of the process.
#[derive(Debug, Clone)]
pub struct RulPredictor {
    model: LstmRegressor,
    degraded: bool,
}

impl RulPredictor {
    /// Wrap a trained regressor.
    pub fn new(model: LstmRegressor) -> Result<Self, ModelError> {
        model.validate()?;
        if model.input_size != INPUT_WIDTH {
            return Err(ModelError::WidthMismatch {
                expected: INPUT_WIDTH,
                got: model.input_size,
            });
        }
        Ok(Self {
            model,
            degraded: false,
        })
    }

    /// Randomly initialised regressor. Predictions are finite but meaningless.
    pub fn untrained(hidden_size: usize, num_layers: usize, seed: Option<u64>) -> Self {
        Self {
            model: LstmRegressor::random(INPUT_WIDTH, hidden_size, num_layers, seed),
            degraded: true,
        }
    }

    /// Load the artifact at `path`, or fall back to random weights when there
    /// is no file. A file that exists but is unusable is an error.
    pub fn load_or_untrained(
        path: &Path,
        hidden_size: usize,
        num_layers: usize,
        seed: Option<u64>,
    ) -> Result<Self, ModelError> {
        if !path.exists() {
            warn!(
                path = %path.display(),
                "no RUL model artifact found, using random weights; predictions are not meaningful"
            );
            return Ok(Self::untrained(hidden_size, num_layers, seed));
        }

        let predictor = Self::new(LstmRegressor::load(path)?)?;
        if predictor.model.hidden_size != hidden_size || predictor.model.num_layers() != num_layers {
            warn!(
                configured_hidden = hidden_size,
                configured_layers = num_layers,
                artifact_hidden = predictor.model.hidden_size,
                artifact_layers = predictor.model.num_layers(),
                "artifact shape differs from config, using the artifact"
            );
        }
        info!(path = %path.display(), "RUL model loaded");
        Ok(predictor)
    }

    pub fn from_config(cfg: &RulStageConfig) -> Result<Self, ModelError> {
        Self::load_or_untrained(&cfg.model_path, cfg.hidden_size, cfg.num_layers, cfg.seed)
    }

    pub fn model(&self) -> &LstmRegressor {
        &self.model
    }

    /// `Ok(None)` when the vector has no advanced features.
    pub fn predict(&self, f: &FeatureVector) -> Result<Option<RulPrediction>, StageError> {
        let Some(advanced) = f.advanced else {
            debug!(machine_id = %f.machine_id, cycle = f.cycle, "no advanced features, skipping");
            return Ok(None);
        };
        if !advanced.is_finite() {
            return Err(StageError::Malformed("advanced features are not finite".into()));
        }

        let predicted_rul = self
            .model
            .predict(&advanced.to_array())
            .map_err(|e| StageError::Malformed(e.to_string()))?;
        if !predicted_rul.is_finite() {
            return Err(StageError::Malformed(format!(
                "regressor produced {predicted_rul} for these features"
            )));
        }

        Ok(Some(RulPrediction {
            machine_id: f.machine_id.clone(),
            timestamp: f.timestamp,
            cycle: f.cycle,
            predicted_rul,
        }))
    }
}

impl Stage for RulPredictor {
    type Input = FeatureVector;
    type Output = RulPrediction;

    fn name(&self) -> &'static str {
        "rul-predictor"
    }

    fn process(&mut self, input: FeatureVector) -> Result<Option<RulPrediction>, StageError> {
        self.predict(&input)
    }

    fn is_degraded(&self) -> bool {
        self.degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mantis_core::{AdvancedFeatures, ModelInputs};

    fn vector(advanced: Option<AdvancedFeatures>) -> FeatureVector {
        FeatureVector {
            machine_id: "engine-3".into(),
            timestamp: Utc::now(),
            cycle: 17,
            advanced,
            model_inputs: ModelInputs::default(),
        }
    }

    fn features() -> AdvancedFeatures {
        AdvancedFeatures {
            skewness: 0.12,
            kurtosis: -1.1,
            energy: 1910.0,
            avg_snr: 10.1,
        }
    }

    #[test]
    fn missing_artifact_falls_back_to_random_weights() {
        let dir = tempfile::tempdir().unwrap();
        let predictor =
            RulPredictor::load_or_untrained(&dir.path().join("model.json"), 64, 2, None).unwrap();
        assert!(predictor.is_degraded());

        let out = predictor.predict(&vector(Some(features()))).unwrap().unwrap();
        assert!(out.predicted_rul.is_finite());
        assert_eq!(out.machine_id, "engine-3");
        assert_eq!(out.cycle, 17);
    }

    #[test]
    fn missing_advanced_yields_nothing() {
        let predictor = RulPredictor::untrained(8, 1, Some(1));
        assert!(predictor.predict(&vector(None)).unwrap().is_none());
    }

    #[test]
    fn non_finite_features_are_malformed() {
        let predictor = RulPredictor::untrained(8, 1, Some(1));
        let mut bad = features();
        bad.energy = f64::INFINITY;
        assert!(matches!(
            predictor.predict(&vector(Some(bad))),
            Err(StageError::Malformed(_))
        ));
    }

    #[test]
    fn saved_artifact_reloads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rul.json");
        let trained = LstmRegressor::random(INPUT_WIDTH, 16, 2, Some(5));
        trained.save(&path).unwrap();

        let predictor = RulPredictor::load_or_untrained(&path, 16, 2, None).unwrap();
        assert!(!predictor.is_degraded());
        assert_eq!(predictor.model(), &trained);

        let expected = trained.predict(&features().to_array()).unwrap();
        let got = predictor.predict(&vector(Some(features()))).unwrap().unwrap();
        assert_eq!(got.predicted_rul, expected);
    }

    #[test]
    fn corrupt_artifact_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            RulPredictor::load_or_untrained(&path, 64, 2, None),
            Err(ModelError::ArtifactFormat { .. })
        ));
    }

    #[test]
    fn wrong_input_width_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        LstmRegressor::random(6, 8, 1, Some(2)).save(&path).unwrap();
        assert!(matches!(
            RulPredictor::load_or_untrained(&path, 8, 1, None),
            Err(ModelError::WidthMismatch { expected: 4, got: 6 })
        ));
    }

    #[test]
    fn predictions_do_not_depend_on_history() {
        let mut stage = RulPredictor::untrained(16, 2, Some(11));
        let first = stage.process(vector(Some(features()))).unwrap().unwrap();
        for _ in 0..3 {
            let mut other = features();
            other.energy = 50.0;
            stage.process(vector(Some(other))).unwrap();
        }
        let again = stage.process(vector(Some(features()))).unwrap().unwrap();
        assert_eq!(first.predicted_rul, again.predicted_rul);
    }
}
