//! Stacked LSTM regressor with a linear head.
//!
//! Gate layout follows the common `[input, forget, cell, output]` stacking,
//! so weights exported from other frameworks map over row for row. Hidden
//! and cell state start at zero for every call; nothing carries over.

use std::path::Path;

use ndarray::{s, Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// One recurrent layer. Rows are the four gates stacked, `4 * hidden` in total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmLayer {
    pub w_ih: Array2<f32>,
    pub w_hh: Array2<f32>,
    pub b_ih: Array1<f32>,
    pub b_hh: Array1<f32>,
}

impl LstmLayer {
    fn random(input: usize, hidden: usize, rng: &mut StdRng) -> Self {
        let k = 1.0 / (hidden as f32).sqrt();
        Self {
            w_ih: Array2::from_shape_fn((4 * hidden, input), |_| rng.gen_range(-k..k)),
            w_hh: Array2::from_shape_fn((4 * hidden, hidden), |_| rng.gen_range(-k..k)),
            b_ih: Array1::from_shape_fn(4 * hidden, |_| rng.gen_range(-k..k)),
            b_hh: Array1::from_shape_fn(4 * hidden, |_| rng.gen_range(-k..k)),
        }
    }

    /// One time step. Returns the new `(h, c)`.
    fn step(
        &self,
        x: ArrayView1<f32>,
        h: &Array1<f32>,
        c: &Array1<f32>,
    ) -> (Array1<f32>, Array1<f32>) {
        let hidden = h.len();
        let gates = self.w_ih.dot(&x) + &self.b_ih + self.w_hh.dot(h) + &self.b_hh;

        let i = gates.slice(s![0..hidden]).mapv(sigmoid);
        let f = gates.slice(s![hidden..2 * hidden]).mapv(sigmoid);
        let g = gates.slice(s![2 * hidden..3 * hidden]).mapv(f32::tanh);
        let o = gates.slice(s![3 * hidden..4 * hidden]).mapv(sigmoid);

        let c_next = &f * c + &i * &g;
        let h_next = &o * &c_next.mapv(f32::tanh);
        (h_next, c_next)
    }

    fn check(&self, index: usize, input: usize, hidden: usize) -> Result<(), ModelError> {
        let rows = 4 * hidden;
        let ok = self.w_ih.dim() == (rows, input)
            && self.w_hh.dim() == (rows, hidden)
            && self.b_ih.len() == rows
            && self.b_hh.len() == rows;
        if ok {
            Ok(())
        } else {
            Err(ModelError::Shape(format!(
                "layer {index}: expected w_ih {rows}x{input}, w_hh {rows}x{hidden}, biases {rows}; \
                 got w_ih {:?}, w_hh {:?}, biases {}/{}",
                self.w_ih.dim(),
                self.w_hh.dim(),
                self.b_ih.len(),
                self.b_hh.len()
            )))
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Sequence regressor: `num_layers` LSTM layers, then `hidden -> 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmRegressor {
    pub input_size: usize,
    pub hidden_size: usize,
    pub layers: Vec<LstmLayer>,
    pub head_w: Array2<f32>,
    pub head_b: Array1<f32>,
}

impl LstmRegressor {
    /// Untrained regressor with uniform random weights. A `seed` makes it
    /// reproducible.
    pub fn random(input_size: usize, hidden_size: usize, num_layers: usize, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let layers = (0..num_layers)
            .map(|l| {
                let input = if l == 0 { input_size } else { hidden_size };
                LstmLayer::random(input, hidden_size, &mut rng)
            })
            .collect();

        let k = 1.0 / (hidden_size as f32).sqrt();
        Self {
            input_size,
            hidden_size,
            layers,
            head_w: Array2::from_shape_fn((1, hidden_size), |_| rng.gen_range(-k..k)),
            head_b: Array1::from_shape_fn(1, |_| rng.gen_range(-k..k)),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Read a regressor written by [`save`](Self::save) and check its shapes.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ModelError::ArtifactIo {
            path: path.to_path_buf(),
            source,
        })?;
        let model: Self = serde_json::from_slice(&raw).map_err(|source| ModelError::ArtifactFormat {
            path: path.to_path_buf(),
            source,
        })?;
        model.validate()?;
        Ok(model)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        let json = serde_json::to_vec(self).map_err(|source| ModelError::ArtifactFormat {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ModelError::ArtifactIo {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Every matrix must agree with `input_size`/`hidden_size`, so `forward`
    /// never sees a shape it cannot multiply.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.input_size == 0 || self.hidden_size == 0 || self.layers.is_empty() {
            return Err(ModelError::Shape(format!(
                "input {}, hidden {}, layers {} must all be non-zero",
                self.input_size,
                self.hidden_size,
                self.layers.len()
            )));
        }
        for (index, layer) in self.layers.iter().enumerate() {
            let input = if index == 0 { self.input_size } else { self.hidden_size };
            layer.check(index, input, self.hidden_size)?;
        }
        if self.head_w.dim() != (1, self.hidden_size) || self.head_b.len() != 1 {
            return Err(ModelError::Shape(format!(
                "head: expected 1x{} and 1 bias, got {:?} and {}",
                self.hidden_size,
                self.head_w.dim(),
                self.head_b.len()
            )));
        }
        Ok(())
    }

    /// Run a sequence through the stack and regress from the last step's
    /// top-layer output.
    pub fn forward(&self, sequence: &[Vec<f32>]) -> Result<f32, ModelError> {
        if sequence.is_empty() {
            return Err(ModelError::InvalidInput("empty sequence".into()));
        }
        if let Some(bad) = sequence.iter().find(|x| x.len() != self.input_size) {
            return Err(ModelError::WidthMismatch {
                expected: self.input_size,
                got: bad.len(),
            });
        }

        let mut h: Vec<Array1<f32>> = vec![Array1::zeros(self.hidden_size); self.layers.len()];
        let mut c: Vec<Array1<f32>> = vec![Array1::zeros(self.hidden_size); self.layers.len()];

        for x in sequence {
            let mut input = Array1::from(x.clone());
            for (l, layer) in self.layers.iter().enumerate() {
                let (h_next, c_next) = layer.step(input.view(), &h[l], &c[l]);
                input = h_next.clone();
                h[l] = h_next;
                c[l] = c_next;
            }
        }

        let top = h.last().ok_or_else(|| ModelError::Shape("no layers".into()))?;
        let out = self.head_w.dot(top) + &self.head_b;
        Ok(out[0])
    }

    /// Single-step prediction from one feature vector.
    pub fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        let step: Vec<f32> = features.iter().map(|&v| v as f32).collect();
        self.forward(&[step]).map(f64::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_model_has_expected_shapes() {
        let model = LstmRegressor::random(4, 64, 2, Some(1));
        assert!(model.validate().is_ok());
        assert_eq!(model.layers[0].w_ih.dim(), (256, 4));
        assert_eq!(model.layers[1].w_ih.dim(), (256, 64));
        assert_eq!(model.head_w.dim(), (1, 64));
    }

    #[test]
    fn prediction_is_finite_and_stateless() {
        let model = LstmRegressor::random(4, 16, 2, Some(3));
        let x = [0.2, -1.1, 1910.0, 8.5];
        let first = model.predict(&x).unwrap();
        let _ = model.predict(&[5.0, 5.0, 5.0, 5.0]).unwrap();
        let again = model.predict(&x).unwrap();
        assert!(first.is_finite());
        assert_eq!(first, again);
    }

    #[test]
    fn seeded_models_match() {
        let a = LstmRegressor::random(4, 8, 1, Some(9));
        let b = LstmRegressor::random(4, 8, 1, Some(9));
        assert_eq!(a, b);
    }

    #[test]
    fn hand_computed_single_unit() {
        // one unit, all weights zero except the cell gate bias and head
        let layer = LstmLayer {
            w_ih: Array2::zeros((4, 1)),
            w_hh: Array2::zeros((4, 1)),
            b_ih: Array1::from(vec![0.0, 0.0, 1.0, 0.0]),
            b_hh: Array1::zeros(4),
        };
        let model = LstmRegressor {
            input_size: 1,
            hidden_size: 1,
            layers: vec![layer],
            head_w: Array2::from_elem((1, 1), 2.0),
            head_b: Array1::from(vec![0.5]),
        };
        // i = f = o = 0.5, g = tanh(1), c = 0.5 * tanh(1), h = 0.5 * tanh(c)
        let c = 0.5 * 1f32.tanh();
        let expected = 2.0 * 0.5 * c.tanh() + 0.5;
        let got = model.forward(&[vec![3.0]]).unwrap();
        assert!((got - expected).abs() < 1e-6);
    }

    #[test]
    fn wrong_width_is_rejected() {
        let model = LstmRegressor::random(4, 8, 1, Some(0));
        assert!(matches!(
            model.predict(&[1.0, 2.0]),
            Err(ModelError::WidthMismatch { expected: 4, got: 2 })
        ));
    }

    #[test]
    fn inconsistent_shapes_fail_validation() {
        let mut model = LstmRegressor::random(4, 8, 2, Some(0));
        model.layers[1].w_hh = Array2::zeros((32, 7));
        assert!(matches!(model.validate(), Err(ModelError::Shape(_))));
    }
}
