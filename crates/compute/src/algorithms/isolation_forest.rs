//! Isolation forest outlier detection.
//!
//! Random axis-aligned trees are grown on subsamples of the training data.
//! Points that are isolated after few splits are outliers. Scores follow the
//! usual convention: `score_samples` is in `[-1, 0)`, lower is more abnormal,
//! and `decision = score_samples - offset` where `offset` is the
//! `contamination` quantile of the training scores. Negative decision means
//! outlier.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

use crate::error::ModelError;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Largest subsample a single tree is grown on.
pub const MAX_SAMPLES: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct ForestParams {
    pub n_trees: usize,
    pub contamination: f64,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            contamination: 0.05,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

/// Result of scoring one vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// `score_samples - offset`; below zero is an outlier.
    pub decision: f64,
    pub is_outlier: bool,
}

/// A fitted, immutable forest.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<Node>,
    width: usize,
    subsample: usize,
    offset: f64,
}

impl IsolationForest {
    /// Grow the forest on `data` and calibrate the decision offset.
    ///
    /// Fails on fewer than two rows, rows of different widths, zero-width rows
    /// or any non-finite value.
    pub fn fit(data: &[Vec<f64>], params: &ForestParams) -> Result<Self, ModelError> {
        if data.len() < 2 {
            return Err(ModelError::NotEnoughSamples { got: data.len() });
        }
        let width = data[0].len();
        if width == 0 {
            return Err(ModelError::InvalidInput("training rows have no features".into()));
        }
        for (row, values) in data.iter().enumerate() {
            if values.len() != width {
                return Err(ModelError::WidthMismatch {
                    expected: width,
                    got: values.len(),
                });
            }
            if values.iter().any(|v| !v.is_finite()) {
                return Err(ModelError::NonFinite { row });
            }
        }
        if params.n_trees == 0 {
            return Err(ModelError::InvalidInput("forest needs at least one tree".into()));
        }
        if !(params.contamination > 0.0 && params.contamination <= 0.5) {
            return Err(ModelError::InvalidInput(format!(
                "contamination must be in (0, 0.5], got {}",
                params.contamination
            )));
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let subsample = data.len().min(MAX_SAMPLES);
        let depth_limit = (subsample.max(2) as f64).log2().ceil() as usize;

        let trees = (0..params.n_trees)
            .map(|_| {
                let rows: Vec<&[f64]> = index::sample(&mut rng, data.len(), subsample)
                    .into_iter()
                    .map(|i| data[i].as_slice())
                    .collect();
                grow(rows, 0, depth_limit, width, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            width,
            subsample,
            offset: 0.0,
        };

        let mut training_scores: Vec<f64> = data.iter().map(|x| forest.raw_score(x)).collect();
        training_scores.sort_by(f64::total_cmp);
        forest.offset = quantile(&training_scores, params.contamination);

        tracing::debug!(
            trees = forest.trees.len(),
            subsample,
            depth_limit,
            offset = forest.offset,
            "isolation forest fitted"
        );
        Ok(forest)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Anomaly score in `[-1, 0)`; lower is more abnormal.
    pub fn score_samples(&self, x: &[f64]) -> Result<f64, ModelError> {
        self.check(x)?;
        Ok(self.raw_score(x))
    }

    pub fn decision(&self, x: &[f64]) -> Result<f64, ModelError> {
        Ok(self.score_samples(x)? - self.offset)
    }

    pub fn verdict(&self, x: &[f64]) -> Result<Verdict, ModelError> {
        let decision = self.decision(x)?;
        Ok(Verdict {
            decision,
            is_outlier: decision < 0.0,
        })
    }

    fn check(&self, x: &[f64]) -> Result<(), ModelError> {
        if x.len() != self.width {
            return Err(ModelError::WidthMismatch {
                expected: self.width,
                got: x.len(),
            });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite { row: 0 });
        }
        Ok(())
    }

    fn raw_score(&self, x: &[f64]) -> f64 {
        let total: f64 = self.trees.iter().map(|t| path_length(t, x)).sum();
        let mean_depth = total / self.trees.len() as f64;
        -(2f64).powf(-mean_depth / average_path_length(self.subsample))
    }
}

fn grow(rows: Vec<&[f64]>, depth: usize, limit: usize, width: usize, rng: &mut StdRng) -> Node {
    if depth >= limit || rows.len() <= 1 {
        return Node::Leaf { size: rows.len() };
    }

    // features that still vary inside this node
    let ranges: Vec<(usize, f64, f64)> = (0..width)
        .filter_map(|f| {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
                (lo.min(r[f]), hi.max(r[f]))
            });
            (lo < hi).then_some((f, lo, hi))
        })
        .collect();
    if ranges.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    let (feature, lo, hi) = ranges[rng.gen_range(0..ranges.len())];
    let threshold = split_point(lo, hi, rng.gen());
    let (left, right): (Vec<&[f64]>, Vec<&[f64]>) =
        rows.into_iter().partition(|r| r[feature] <= threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(grow(left, depth + 1, limit, width, rng)),
        right: Box::new(grow(right, depth + 1, limit, width, rng)),
    }
}

/// Point in `[lo, hi)` at fraction `u`. Interpolates instead of using
/// `hi - lo`, which overflows for finite bounds of opposite sign near `f64::MAX`.
fn split_point(lo: f64, hi: f64, u: f64) -> f64 {
    let t = lo * (1.0 - u) + hi * u;
    if t >= hi {
        lo
    } else {
        t.max(lo)
    }
}

fn path_length(mut node: &Node, x: &[f64]) -> f64 {
    let mut depth = 0usize;
    loop {
        match node {
            Node::Leaf { size } => return depth as f64 + average_path_length(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                node = if x[*feature] <= *threshold {
                    left.as_ref()
                } else {
                    right.as_ref()
                };
                depth += 1;
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Linear-interpolated quantile of an ascending slice, `q` in `[0, 1]`.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bell-shaped points around 0.5 in every feature.
    fn cluster(n: usize) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..n)
            .map(|_| {
                (0..4)
                    .map(|_| (0..3).map(|_| rng.gen::<f64>()).sum::<f64>() / 3.0)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn average_path_length_reference_values() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        // 2 * (ln 255 + gamma) - 2 * 255 / 256
        let expected = 2.0 * (255f64.ln() + EULER_GAMMA) - 2.0 * 255.0 / 256.0;
        assert!((average_path_length(256) - expected).abs() < 1e-12);
    }

    #[test]
    fn quantile_interpolates() {
        let v = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&v, 0.0), 0.0);
        assert_eq!(quantile(&v, 1.0), 4.0);
        assert!((quantile(&v, 0.05) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn obvious_outlier_is_flagged() {
        let forest = IsolationForest::fit(&cluster(200), &ForestParams::default()).unwrap();
        let outlier = forest.verdict(&[5.0, 5.0, 5.0, 5.0]).unwrap();
        assert!(outlier.is_outlier);
        assert!(outlier.decision < 0.0);

        let inlier = forest.verdict(&[0.5, 0.5, 0.5, 0.5]).unwrap();
        assert!(inlier.decision > outlier.decision);
    }

    #[test]
    fn identical_rows_score_exactly_at_offset() {
        let rows = vec![vec![0.5, -1.0, 20.0, 3.0]; 5];
        let forest = IsolationForest::fit(&rows, &ForestParams::default()).unwrap();
        let v = forest.verdict(&rows[0]).unwrap();
        assert_eq!(v.decision, 0.0);
        assert!(!v.is_outlier);
    }

    #[test]
    fn same_seed_same_scores() {
        let data = cluster(60);
        let a = IsolationForest::fit(&data, &ForestParams::default()).unwrap();
        let b = IsolationForest::fit(&data, &ForestParams::default()).unwrap();
        let x = [0.1, 0.9, 0.4, 0.6];
        assert_eq!(a.decision(&x).unwrap(), b.decision(&x).unwrap());
    }

    #[test]
    fn scores_are_in_range() {
        let forest = IsolationForest::fit(&cluster(40), &ForestParams::default()).unwrap();
        for x in cluster(40) {
            let s = forest.score_samples(&x).unwrap();
            assert!((-1.0..0.0).contains(&s), "score {s}");
        }
    }

    #[test]
    fn fit_rejects_degenerate_input() {
        let params = ForestParams::default();
        assert!(matches!(
            IsolationForest::fit(&[vec![1.0; 4]], &params),
            Err(ModelError::NotEnoughSamples { got: 1 })
        ));
        assert!(matches!(
            IsolationForest::fit(&[vec![1.0; 4], vec![1.0; 3]], &params),
            Err(ModelError::WidthMismatch { .. })
        ));
        assert!(matches!(
            IsolationForest::fit(&[vec![1.0; 4], vec![f64::NAN, 1.0, 1.0, 1.0]], &params),
            Err(ModelError::NonFinite { row: 1 })
        ));
    }

    #[test]
    fn split_point_stays_in_bounds() {
        assert_eq!(split_point(-1.5e308, 1.5e308, 0.5), 0.0);
        for u in [0.0, 0.25, 0.999_999_999_999] {
            let t = split_point(-f64::MAX, f64::MAX, u);
            assert!(t.is_finite() && t >= -f64::MAX && t < f64::MAX, "threshold {t}");
        }
        // rounding up to `hi` falls back to `lo`
        assert_eq!(split_point(1.0, 1.0 + f64::EPSILON, 1.0), 1.0);
    }

    #[test]
    fn fits_values_spanning_the_whole_f64_range() {
        let data = vec![vec![0.0, -1.2, 1910.0, -1.5e308], vec![0.0, -1.2, 1910.0, 1.5e308]];
        let forest = IsolationForest::fit(&data, &ForestParams::default()).unwrap();
        assert!(forest.offset().is_finite());
        assert!(forest.decision(&data[1]).unwrap().is_finite());
    }

    #[test]
    fn scoring_checks_width() {
        let forest = IsolationForest::fit(&cluster(10), &ForestParams::default()).unwrap();
        assert!(forest.verdict(&[1.0, 2.0]).is_err());
    }
}
