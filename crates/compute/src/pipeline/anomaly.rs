//! Buffer-then-fit anomaly scoring.
//!
//! A scorer collects the first `B` advanced-feature vectors it sees, fits an
//! isolation forest on them exactly once, throws the buffer away and from then
//! on only scores. Nothing is judged before the fit, and the vector that
//! completes the buffer is not scored either.

use std::collections::HashMap;

use tracing::{debug, info};

use mantis_core::config::{AnomalyStageConfig, ScorerScope};
use mantis_core::{AnomalyEvent, FeatureVector, ANOMALY_DETAILS};

use super::Stage;
use crate::algorithms::isolation_forest::{ForestParams, IsolationForest};
use crate::error::StageError;

/// Lifecycle of one scorer. `Fitted` is terminal.
#[derive(Debug)]
pub enum AnomalyModelState {
    Untrained,
    Buffering(Vec<[f64; 4]>),
    Fitted(IsolationForest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Untrained,
    Buffering,
    Fitted,
}

impl AnomalyModelState {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Untrained => Phase::Untrained,
            Self::Buffering(_) => Phase::Buffering,
            Self::Fitted(_) => Phase::Fitted,
        }
    }
}

/// One buffer and one model.
#[derive(Debug)]
pub struct AnomalyScorer {
    state: AnomalyModelState,
    capacity: usize,
    params: ForestParams,
}

impl AnomalyScorer {
    /// `capacity` is B, the number of vectors buffered before the fit.
    pub fn new(capacity: usize, params: ForestParams) -> Self {
        Self {
            state: AnomalyModelState::Untrained,
            capacity: capacity.max(1),
            params,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn state(&self) -> &AnomalyModelState {
        &self.state
    }

    pub fn buffered(&self) -> usize {
        match &self.state {
            AnomalyModelState::Buffering(buf) => buf.len(),
            _ => 0,
        }
    }

    /// Feed one vector.
    ///
    /// Returns an event only once fitted and only for outliers. A vector
    /// without usable advanced features changes nothing. A failed fit is a
    /// [`StageError::ModelFit`] and leaves the scorer buffering.
    pub fn observe(&mut self, features: &FeatureVector) -> Result<Option<AnomalyEvent>, StageError> {
        let Some(x) = features.advanced.filter(|a| a.is_finite()).map(|a| a.to_array()) else {
            debug!(
                machine_id = %features.machine_id,
                cycle = features.cycle,
                "no usable advanced features, skipping"
            );
            return Ok(None);
        };

        if let AnomalyModelState::Fitted(model) = &self.state {
            let verdict = model
                .verdict(&x)
                .map_err(|e| StageError::Malformed(e.to_string()))?;
            if !verdict.is_outlier {
                return Ok(None);
            }
            return Ok(Some(AnomalyEvent {
                machine_id: features.machine_id.clone(),
                timestamp: features.timestamp,
                cycle: features.cycle,
                anomaly_score: verdict.decision,
                is_anomaly: true,
                details: ANOMALY_DETAILS.to_string(),
            }));
        }

        if let AnomalyModelState::Untrained = self.state {
            debug!(capacity = self.capacity, "first vector, buffering");
            self.state = AnomalyModelState::Buffering(Vec::with_capacity(self.capacity));
        }
        let AnomalyModelState::Buffering(buffer) = &mut self.state else {
            return Ok(None);
        };

        buffer.push(x);
        if buffer.len() < self.capacity {
            return Ok(None);
        }

        // the buffer stays in place until the fit has produced a model
        info!(samples = buffer.len(), trees = self.params.n_trees, "buffer full, fitting anomaly model");
        let rows: Vec<Vec<f64>> = buffer.iter().map(|r| r.to_vec()).collect();
        let model = IsolationForest::fit(&rows, &self.params).map_err(StageError::ModelFit)?;
        info!(offset = model.offset(), "anomaly model fitted");
        self.state = AnomalyModelState::Fitted(model);
        Ok(None)
    }
}

enum Scorers {
    Process(AnomalyScorer),
    Machine(HashMap<String, AnomalyScorer>),
}

/// Stage owning the scorer(s): one per process or one per machine id.
pub struct AnomalyStage {
    scorers: Scorers,
    capacity: usize,
    params: ForestParams,
}

impl AnomalyStage {
    pub fn new(scope: ScorerScope, capacity: usize, params: ForestParams) -> Self {
        let scorers = match scope {
            ScorerScope::Process => Scorers::Process(AnomalyScorer::new(capacity, params.clone())),
            ScorerScope::Machine => Scorers::Machine(HashMap::new()),
        };
        Self {
            scorers,
            capacity,
            params,
        }
    }

    pub fn from_config(cfg: &AnomalyStageConfig) -> Self {
        let params = ForestParams {
            n_trees: cfg.n_trees,
            contamination: cfg.contamination,
            seed: cfg.seed,
        };
        Self::new(cfg.scope, cfg.buffer_capacity, params)
    }

    /// Phase of the scorer responsible for `machine_id`, if it exists yet.
    pub fn phase_for(&self, machine_id: &str) -> Option<Phase> {
        match &self.scorers {
            Scorers::Process(scorer) => Some(scorer.phase()),
            Scorers::Machine(map) => map.get(machine_id).map(AnomalyScorer::phase),
        }
    }
}

impl Stage for AnomalyStage {
    type Input = FeatureVector;
    type Output = AnomalyEvent;

    const EMITS_ANOMALIES: bool = true;

    fn name(&self) -> &'static str {
        "anomaly-scorer"
    }

    fn process(&mut self, input: FeatureVector) -> Result<Option<AnomalyEvent>, StageError> {
        let scorer = match &mut self.scorers {
            Scorers::Process(scorer) => scorer,
            Scorers::Machine(map) => map
                .entry(input.machine_id.clone())
                .or_insert_with(|| AnomalyScorer::new(self.capacity, self.params.clone())),
        };
        scorer.observe(&input)
    }
}
