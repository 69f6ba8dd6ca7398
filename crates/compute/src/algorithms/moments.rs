//! Population moments over small slices of sensor values.

/// Central moments `m2`, `m3`, `m4` about the mean (divided by n, not n - 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentralMoments {
    pub mean: f64,
    pub m2: f64,
    pub m3: f64,
    pub m4: f64,
}

impl CentralMoments {
    /// `None` for an empty slice.
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;

        let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
        for &v in values {
            let d = v - mean;
            let d2 = d * d;
            m2 += d2;
            m3 += d2 * d;
            m4 += d2 * d2;
        }

        Some(Self {
            mean,
            m2: m2 / n,
            m3: m3 / n,
            m4: m4 / n,
        })
    }

    /// Fisher-Pearson coefficient `m3 / m2^1.5`; 0 when the values are constant.
    pub fn skewness(&self) -> f64 {
        if self.m2 <= 0.0 {
            return 0.0;
        }
        self.m3 / self.m2.powf(1.5)
    }

    /// Excess kurtosis `m4 / m2^2 - 3`; 0 when the values are constant.
    pub fn excess_kurtosis(&self) -> f64 {
        if self.m2 <= 0.0 {
            return 0.0;
        }
        self.m4 / (self.m2 * self.m2) - 3.0
    }
}

/// Sum of squares.
pub fn energy(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum()
}

/// Mean of `mean[i] / std[i]`, counting a sensor with `std[i] == 0` as 0.
///
/// Pairs beyond the shorter slice are ignored; an empty input yields 0.
pub fn average_snr(means: &[f64], stds: &[f64]) -> f64 {
    let n = means.len().min(stds.len());
    if n == 0 {
        return 0.0;
    }
    let total: f64 = means
        .iter()
        .zip(stds)
        .map(|(&m, &s)| if s == 0.0 { 0.0 } else { m / s })
        .sum();
    total / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn symmetric_values_have_zero_skew() {
        let m = CentralMoments::of(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert!((m.mean - 3.0).abs() < EPS);
        assert!(m.skewness().abs() < EPS);
        // uniform 1..5: m2 = 2, m4 = 6.8, excess = 6.8 / 4 - 3
        assert!((m.excess_kurtosis() - (-1.3)).abs() < EPS);
    }

    #[test]
    fn right_tail_is_positive_skew() {
        let m = CentralMoments::of(&[0.0, 0.0, 0.0, 10.0]).unwrap();
        // m2 = 18.75, m3 = 93.75
        let expected = 93.75 / 18.75f64.powf(1.5);
        assert!((m.skewness() - expected).abs() < EPS);
        assert!(m.skewness() > 0.0);
    }

    #[test]
    fn constant_values_report_zero() {
        let m = CentralMoments::of(&[4.2; 6]).unwrap();
        assert_eq!(m.skewness(), 0.0);
        assert_eq!(m.excess_kurtosis(), 0.0);
    }

    #[test]
    fn empty_has_no_moments() {
        assert!(CentralMoments::of(&[]).is_none());
    }

    #[test]
    fn energy_is_sum_of_squares() {
        assert!((energy(&[1.0, -2.0, 3.0]) - 14.0).abs() < EPS);
        assert_eq!(energy(&[]), 0.0);
    }

    #[test]
    fn snr_zero_std_counts_as_zero() {
        let snr = average_snr(&[10.0, 4.0, 7.0], &[2.0, 0.0, 1.0]);
        assert!((snr - (5.0 + 0.0 + 7.0) / 3.0).abs() < EPS);
        assert!(snr.is_finite());
    }
}
