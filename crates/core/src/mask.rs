use crate::error::MantisError;

/// Sensors kept by the reference deployment (0-based): 14 of 21 channels.
pub const REFERENCE_MASK: [usize; 14] = [1, 2, 3, 6, 7, 8, 10, 11, 12, 13, 14, 16, 19, 20];

/// Raw sensor count of the reference deployment.
pub const REFERENCE_SENSOR_COUNT: usize = 21;

/// Fixed subset of sensor indices applied before feature derivation.
///
/// Always non-empty, strictly increasing and within `0..sensor_count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionMask {
    indices: Vec<usize>,
    sensor_count: usize,
}

impl SelectionMask {
    pub fn new(indices: Vec<usize>, sensor_count: usize) -> Result<Self, MantisError> {
        if indices.is_empty() {
            return Err(MantisError::InvalidMask("mask selects no sensors".into()));
        }
        if let Some(pair) = indices.windows(2).find(|w| w[0] >= w[1]) {
            return Err(MantisError::InvalidMask(format!(
                "indices must be strictly increasing, found {} then {}",
                pair[0], pair[1]
            )));
        }
        if let Some(&last) = indices.last() {
            if last >= sensor_count {
                return Err(MantisError::InvalidMask(format!(
                    "index {last} out of range for {sensor_count} sensors"
                )));
            }
        }
        Ok(Self {
            indices,
            sensor_count,
        })
    }

    pub fn reference() -> Self {
        Self {
            indices: REFERENCE_MASK.to_vec(),
            sensor_count: REFERENCE_SENSOR_COUNT,
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// K, the number of selected sensors.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// N, the raw sensor count the mask was validated against.
    pub fn sensor_count(&self) -> usize {
        self.sensor_count
    }

    /// Select the masked values in mask order; `None` when `values` is too short.
    pub fn apply(&self, values: &[f64]) -> Option<Vec<f64>> {
        self.indices.iter().map(|&i| values.get(i).copied()).collect()
    }
}

impl Default for SelectionMask {
    fn default() -> Self {
        Self::reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_mask_is_valid() {
        let mask = SelectionMask::new(REFERENCE_MASK.to_vec(), REFERENCE_SENSOR_COUNT).unwrap();
        assert_eq!(mask, SelectionMask::reference());
        assert_eq!(mask.len(), 14);
    }

    #[test]
    fn rejects_empty() {
        assert!(SelectionMask::new(vec![], 21).is_err());
    }

    #[test]
    fn rejects_duplicates_and_disorder() {
        assert!(SelectionMask::new(vec![1, 1, 2], 21).is_err());
        assert!(SelectionMask::new(vec![3, 2], 21).is_err());
    }

    #[test]
    fn rejects_out_of_range() {
        let err = SelectionMask::new(vec![0, 21], 21).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn apply_keeps_mask_order() {
        let mask = SelectionMask::new(vec![0, 2, 4], 5).unwrap();
        assert_eq!(mask.apply(&[10.0, 11.0, 12.0, 13.0, 14.0]), Some(vec![10.0, 12.0, 14.0]));
    }

    #[test]
    fn apply_on_short_input_is_none() {
        let mask = SelectionMask::new(vec![0, 4], 5).unwrap();
        assert_eq!(mask.apply(&[1.0, 2.0]), None);
    }
}
