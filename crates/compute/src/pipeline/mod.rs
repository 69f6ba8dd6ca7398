//! The three pipeline stages.
//!
//! Every stage turns one decoded input record into zero or one output record:
//!
//! - [`FeatureReducer`]: `WindowedStats` -> `FeatureVector`
//! - [`AnomalyStage`]: `FeatureVector` -> `AnomalyEvent` (outliers only)
//! - [`RulPredictor`]: `FeatureVector` -> `RulPrediction`
//!
//! Stages are plain synchronous state owned by exactly one loop; see
//! [`crate::runner::StageLoop`] for the transport side.

pub mod anomaly;
pub mod features;
pub mod rul;

use serde::de::DeserializeOwned;
use serde::Serialize;

use mantis_core::{AnomalyEvent, FeatureVector, RulPrediction, WindowedStats};

use crate::error::StageError;

pub use anomaly::{AnomalyModelState, AnomalyScorer, AnomalyStage, Phase};
pub use features::{reduce, FeatureReducer};
pub use rul::RulPredictor;

/// A record that belongs to one machine at one cycle.
pub trait MachineRecord {
    fn machine_id(&self) -> &str;
    fn cycle(&self) -> u64;
}

macro_rules! machine_record {
    ($($ty:ty),* $(,)?) => {
        $(impl MachineRecord for $ty {
            fn machine_id(&self) -> &str {
                &self.machine_id
            }

            fn cycle(&self) -> u64 {
                self.cycle
            }
        })*
    };
}

machine_record!(WindowedStats, FeatureVector, AnomalyEvent, RulPrediction);

/// One processing step of the pipeline.
pub trait Stage: Send + Sync + 'static {
    type Input: DeserializeOwned + MachineRecord + Send;
    type Output: Serialize + MachineRecord + Send + Sync;

    /// Whether each emitted output counts as a detected anomaly.
    const EMITS_ANOMALIES: bool = false;

    fn name(&self) -> &'static str;

    /// `Ok(None)` means "nothing to publish for this input".
    fn process(&mut self, input: Self::Input) -> Result<Option<Self::Output>, StageError>;

    /// Running, but with output that should not be trusted.
    fn is_degraded(&self) -> bool {
        false
    }
}
