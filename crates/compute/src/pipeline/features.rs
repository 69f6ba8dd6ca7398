//! Feature reduction: sensor mask plus shape, energy and SNR descriptors.

use mantis_core::{AdvancedFeatures, FeatureVector, ModelInputs, SelectionMask, WindowedStats};

use super::Stage;
use crate::algorithms::moments::{self, CentralMoments};
use crate::error::StageError;

/// Derive a [`FeatureVector`] from one window of sensor statistics.
///
/// Pure function of its inputs. Fails with [`StageError::Malformed`] when
/// `mean` is empty, when `mean` or `std` are too short for the mask, or when
/// a selected value or a derived descriptor is not finite.
pub fn reduce(w: &WindowedStats, mask: &SelectionMask) -> Result<FeatureVector, StageError> {
    if w.mean.is_empty() {
        return Err(StageError::Malformed("window has no sensor means".into()));
    }
    let mean = mask.apply(&w.mean).ok_or_else(|| {
        StageError::Malformed(format!(
            "mean has {} sensors, mask needs {}",
            w.mean.len(),
            required_len(mask)
        ))
    })?;
    let std = mask.apply(&w.std).ok_or_else(|| {
        StageError::Malformed(format!(
            "std has {} sensors, mask needs {}",
            w.std.len(),
            required_len(mask)
        ))
    })?;
    if mean.iter().chain(&std).any(|v| !v.is_finite()) {
        return Err(StageError::Malformed("selected sensor values are not finite".into()));
    }

    let shape = CentralMoments::of(&mean)
        .ok_or_else(|| StageError::Malformed("mask selected no sensors".into()))?;
    let advanced = AdvancedFeatures {
        skewness: shape.skewness(),
        kurtosis: shape.excess_kurtosis(),
        energy: moments::energy(&mean),
        avg_snr: moments::average_snr(&mean, &std),
    };
    if !advanced.is_finite() {
        return Err(StageError::Malformed(format!("derived features overflow: {advanced:?}")));
    }

    Ok(FeatureVector {
        machine_id: w.machine_id.clone(),
        timestamp: w.timestamp,
        cycle: w.cycle,
        advanced: Some(advanced),
        model_inputs: ModelInputs { mean, std },
    })
}

fn required_len(mask: &SelectionMask) -> usize {
    mask.indices().last().map_or(0, |i| i + 1)
}

/// Stateless stage wrapping [`reduce`] with a fixed mask.
#[derive(Debug, Clone)]
pub struct FeatureReducer {
    mask: SelectionMask,
}

impl FeatureReducer {
    pub fn new(mask: SelectionMask) -> Self {
        Self { mask }
    }

    pub fn mask(&self) -> &SelectionMask {
        &self.mask
    }
}

impl Stage for FeatureReducer {
    type Input = WindowedStats;
    type Output = FeatureVector;

    fn name(&self) -> &'static str {
        "feature-reducer"
    }

    fn process(&mut self, input: WindowedStats) -> Result<Option<FeatureVector>, StageError> {
        reduce(&input, &self.mask).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mantis_core::mask::REFERENCE_MASK;

    fn window(mean: Vec<f64>, std: Vec<f64>) -> WindowedStats {
        WindowedStats {
            machine_id: "machine-1".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            cycle: 42,
            last: mean.clone(),
            mean,
            std,
        }
    }

    #[test]
    fn reference_window_scenario() {
        let w = window((0..21).map(f64::from).collect(), vec![1.0; 21]);
        let f = reduce(&w, &SelectionMask::reference()).unwrap();

        let expected: Vec<f64> = REFERENCE_MASK.iter().map(|&i| i as f64).collect();
        assert_eq!(f.model_inputs.mean, expected);
        assert_eq!(f.model_inputs.std, vec![1.0; 14]);

        let adv = f.advanced.unwrap();
        assert!((adv.energy - 1910.0).abs() < 1e-9);
        let avg = expected.iter().sum::<f64>() / 14.0;
        assert!((adv.avg_snr - avg).abs() < 1e-9);
        assert_eq!(f.machine_id, "machine-1");
        assert_eq!(f.cycle, 42);
        assert_eq!(f.timestamp, w.timestamp);
    }

    #[test]
    fn energy_matches_selected_means() {
        let mask = SelectionMask::new(vec![0, 3, 4], 6).unwrap();
        let w = window(vec![1.5, 9.0, 9.0, -2.0, 0.25, 9.0], vec![1.0; 6]);
        let f = reduce(&w, &mask).unwrap();
        let energy: f64 = f.model_inputs.mean.iter().map(|x| x * x).sum();
        assert!((f.advanced.unwrap().energy - energy).abs() < 1e-9);
    }

    #[test]
    fn zero_std_contributes_zero_snr() {
        let mask = SelectionMask::new(vec![0, 1], 2).unwrap();
        let f = reduce(&window(vec![4.0, 6.0], vec![0.0, 2.0]), &mask).unwrap();
        let adv = f.advanced.unwrap();
        assert!((adv.avg_snr - 1.5).abs() < 1e-12);
        assert!(adv.is_finite());
    }

    #[test]
    fn skew_and_kurtosis_use_population_moments() {
        let mask = SelectionMask::new(vec![0, 1, 2, 3, 4], 5).unwrap();
        let f = reduce(&window(vec![1.0, 2.0, 3.0, 4.0, 5.0], vec![1.0; 5]), &mask).unwrap();
        let adv = f.advanced.unwrap();
        assert!(adv.skewness.abs() < 1e-12);
        assert!((adv.kurtosis + 1.3).abs() < 1e-12);
    }

    #[test]
    fn empty_mean_is_malformed() {
        let err = reduce(&window(vec![], vec![]), &SelectionMask::reference()).unwrap_err();
        assert!(matches!(err, StageError::Malformed(_)));
    }

    #[test]
    fn short_vectors_are_malformed() {
        let short = window(vec![1.0; 10], vec![1.0; 21]);
        assert!(reduce(&short, &SelectionMask::reference()).is_err());

        let short_std = window(vec![1.0; 21], vec![1.0; 3]);
        assert!(reduce(&short_std, &SelectionMask::reference()).is_err());
    }

    #[test]
    fn non_finite_selection_is_malformed() {
        let mut mean = vec![1.0; 21];
        mean[2] = f64::NAN;
        assert!(reduce(&window(mean, vec![1.0; 21]), &SelectionMask::reference()).is_err());
    }

    #[test]
    fn stage_always_emits_for_valid_input() {
        let mut stage = FeatureReducer::new(SelectionMask::reference());
        let out = stage.process(window(vec![2.0; 21], vec![1.0; 21])).unwrap();
        let adv = out.unwrap().advanced.unwrap();
        assert_eq!(adv.skewness, 0.0);
        assert_eq!(adv.kurtosis, 0.0);
    }
}
