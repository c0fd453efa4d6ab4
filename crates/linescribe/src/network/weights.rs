//! Dense weight matrices with an optional quantized form.
//!
//! A matrix for a layer with `ni` inputs and `no` outputs has shape
//! `no × (ni + 1)`; the last column is the bias. After
//! [`WeightMatrix::convert_to_int`] the float weights are dropped and each row
//! is stored as `i8` values with one scale factor per row.

use super::io::{INT_SCALE, NetworkIO, flat, flat_mut};
use super::scratch::NetworkScratch;
use crate::dotproduct::{DotProduct, dot_product_i8};
use crate::{LinescribeError, Result};
use ndarray::{Array2, Zip};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const ADAM_EPSILON: f32 = 1e-8;

/// Sample counts at or above this are treated as "bias correction finished".
const ADAM_CORRECTION_LIMIT: u32 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightMatrix {
    wf: Array2<f32>,
    #[serde(default)]
    wi: Array2<i8>,
    #[serde(default)]
    scales: Vec<f32>,
    #[serde(default)]
    int_mode: bool,
    #[serde(default)]
    use_adam: bool,
    #[serde(skip)]
    training: Option<Box<Gradients>>,
}

#[derive(Debug, Clone)]
struct Gradients {
    dw: Array2<f32>,
    updates: Array2<f32>,
    dw_sq_sum: Array2<f32>,
}

impl WeightMatrix {
    /// All-zero float matrix.
    pub fn zeros(no: usize, ni: usize) -> Self {
        Self::from_array(Array2::zeros((no, ni + 1)))
    }

    /// Float matrix from explicit weights; the last column is the bias.
    pub fn from_array(wf: Array2<f32>) -> Self {
        let wf = if wf.is_standard_layout() {
            wf
        } else {
            wf.as_standard_layout().into_owned()
        };
        Self {
            wf,
            wi: Array2::zeros((0, 0)),
            scales: Vec::new(),
            int_mode: false,
            use_adam: false,
            training: None,
        }
    }

    /// Uniform random weights in `[-range, range]`.
    pub fn random<R: Rng + ?Sized>(no: usize, ni: usize, range: f32, rng: &mut R) -> Self {
        let wf = Array2::from_shape_simple_fn((no, ni + 1), || rng.random_range(-range..=range));
        Self::from_array(wf)
    }

    pub fn num_outputs(&self) -> usize {
        if self.int_mode { self.wi.nrows() } else { self.wf.nrows() }
    }

    pub fn num_inputs(&self) -> usize {
        let cols = if self.int_mode { self.wi.ncols() } else { self.wf.ncols() };
        cols.saturating_sub(1)
    }

    pub fn num_weights(&self) -> usize {
        self.num_outputs() * (self.num_inputs() + 1)
    }

    pub fn is_int_mode(&self) -> bool {
        self.int_mode
    }

    pub fn set_use_adam(&mut self, use_adam: bool) {
        self.use_adam = use_adam;
    }

    /// Float weights (empty once quantized).
    pub fn float_weights(&self) -> &Array2<f32> {
        &self.wf
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    /// Check the matrix against the layer shape it is meant to serve.
    pub fn validate(&self, no: usize, ni: usize) -> Result<()> {
        if self.num_outputs() != no || self.num_inputs() != ni {
            return Err(LinescribeError::model(format!(
                "weight matrix is {}x{} but the layer needs {}x{}",
                self.num_outputs(),
                self.num_inputs() + 1,
                no,
                ni + 1
            )));
        }
        if self.int_mode && self.scales.len() != no {
            return Err(LinescribeError::model(format!(
                "quantized weight matrix has {} scales for {} rows",
                self.scales.len(),
                no
            )));
        }
        Ok(())
    }

    #[inline]
    fn float_row(&self, r: usize) -> &[f32] {
        let cols = self.wf.ncols();
        &flat(&self.wf)[r * cols..(r + 1) * cols]
    }

    #[inline]
    fn int_row(&self, r: usize) -> &[i8] {
        let cols = self.wi.ncols();
        &flat(&self.wi)[r * cols..(r + 1) * cols]
    }

    /// `out = W · [input, 1]` with float weights.
    pub fn matrix_dot_vector(&self, dot: DotProduct, input: &[f32], out: &mut [f32]) {
        let ni = self.num_inputs();
        debug_assert!(!self.int_mode);
        debug_assert_eq!(input.len(), ni);
        for (r, o) in out.iter_mut().enumerate() {
            let row = self.float_row(r);
            *o = dot.compute(&row[..ni], input) + row[ni];
        }
    }

    /// `out = W · [input, 1]` with quantized weights and inputs; output is float.
    pub fn matrix_dot_vector_int(&self, input: &[i8], out: &mut [f32]) {
        let ni = self.num_inputs();
        debug_assert!(self.int_mode);
        debug_assert_eq!(input.len(), ni);
        for (r, o) in out.iter_mut().enumerate() {
            let row = self.int_row(r);
            let total = dot_product_i8(&row[..ni], input) + i32::from(row[ni]) * INT_SCALE as i32;
            *o = total as f32 * self.scales[r] / INT_SCALE;
        }
    }

    /// `v = Wᵀ · u`, dropping the bias column. Used to propagate errors backwards.
    pub fn vector_dot_matrix(&self, u: &[f32], v: &mut [f32]) {
        let ni = self.num_inputs();
        v[..ni].fill(0.0);
        if self.int_mode {
            for (r, &ur) in u.iter().enumerate() {
                let scale = self.scales[r];
                for (vj, &w) in v[..ni].iter_mut().zip(self.int_row(r)) {
                    *vj += ur * f32::from(w) * scale;
                }
            }
        } else {
            for (r, &ur) in u.iter().enumerate() {
                for (vj, &w) in v[..ni].iter_mut().zip(self.float_row(r)) {
                    *vj += ur * w;
                }
            }
        }
    }

    /// Quantize to 8 bits with a per-row scale and drop the float weights.
    pub fn convert_to_int(&mut self) {
        if self.int_mode {
            return;
        }
        let (no, cols) = self.wf.dim();
        let mut wi = Array2::<i8>::zeros((no, cols));
        let mut scales = Vec::with_capacity(no);
        for r in 0..no {
            let row = self.float_row(r);
            let max_abs = row.iter().fold(0.0f32, |m, w| m.max(w.abs()));
            let scale = if max_abs > 0.0 { max_abs / INT_SCALE } else { 1.0 };
            let dst = &mut flat_mut(&mut wi)[r * cols..(r + 1) * cols];
            for (q, &w) in dst.iter_mut().zip(row) {
                *q = (w / scale).round().clamp(-INT_SCALE, INT_SCALE) as i8;
            }
            scales.push(scale);
        }
        self.wi = wi;
        self.scales = scales;
        self.wf = Array2::zeros((0, 0));
        self.int_mode = true;
        self.training = None;
    }

    /// Allocate gradient accumulators.
    ///
    /// # Panics
    ///
    /// Panics on a quantized matrix: quantized models are inference-only.
    pub fn init_backward(&mut self) {
        assert!(!self.int_mode, "cannot train a quantized weight matrix");
        if self.training.is_none() {
            let shape = self.wf.raw_dim();
            self.training = Some(Box::new(Gradients {
                dw: Array2::zeros(shape.clone()),
                updates: Array2::zeros(shape.clone()),
                dw_sq_sum: Array2::zeros(shape),
            }));
        }
    }

    pub fn is_training(&self) -> bool {
        self.training.is_some()
    }

    /// Accumulated gradient (zero-sized when not training).
    pub fn gradient(&self) -> Option<&Array2<f32>> {
        self.training.as_ref().map(|g| &g.dw)
    }

    /// `dW += e ⊗ [x, 1]` for a single sample.
    pub fn accumulate_outer(&mut self, errors: &[f32], inputs: &[f32]) {
        self.init_backward();
        let Some(grads) = self.training.as_mut() else {
            return;
        };
        let cols = grads.dw.ncols();
        let dw = flat_mut(&mut grads.dw);
        for (r, &e) in errors.iter().enumerate() {
            if e == 0.0 {
                continue;
            }
            let row = &mut dw[r * cols..(r + 1) * cols];
            for (d, &x) in row.iter_mut().zip(inputs) {
                *d += e * x;
            }
            row[cols - 1] += e;
        }
    }

    /// `dW += Σ_t errors[t] ⊗ [inputs[t], 1]` over valid timesteps.
    ///
    /// Rows of `dW` are independent, so they are summed in parallel; each row
    /// accumulates over time in order, keeping the result deterministic.
    pub fn sum_outer_transposed(&mut self, errors: &NetworkIO, inputs: &NetworkIO, scratch: &NetworkScratch) {
        self.init_backward();
        let Some(grads) = self.training.as_mut() else {
            return;
        };
        let cols = grads.dw.ncols();
        let ni = cols - 1;
        let inputs = inputs.to_float();
        let width = errors.width();
        let dw = flat_mut(&mut grads.dw);
        scratch.install(|| {
            dw.par_chunks_mut(cols).enumerate().for_each(|(r, row)| {
                for t in 0..width {
                    if !errors.is_valid(t) {
                        continue;
                    }
                    let e = errors.f(t)[r];
                    if e == 0.0 {
                        continue;
                    }
                    for (d, &x) in row[..ni].iter_mut().zip(inputs.f(t)) {
                        *d += e * x;
                    }
                    row[ni] += e;
                }
            });
        });
    }

    /// Apply the accumulated gradient and clear it.
    ///
    /// With Adam enabled and a positive momentum this is an Adam step whose
    /// bias correction uses `num_samples`; otherwise it is plain momentum SGD.
    pub fn update(&mut self, learning_rate: f32, momentum: f32, adam_beta: f32, num_samples: u32) {
        assert!(!self.int_mode, "cannot update a quantized weight matrix");
        let use_adam = self.use_adam;
        let Some(grads) = self.training.as_mut() else {
            return;
        };
        let mut learning_rate = learning_rate;
        if use_adam && momentum > 0.0 && num_samples > 0 && num_samples < ADAM_CORRECTION_LIMIT {
            let n = num_samples as i32;
            learning_rate *= (1.0 - adam_beta.powi(n)).sqrt();
            learning_rate /= 1.0 - momentum.powi(n);
        }
        if use_adam && num_samples > 0 && momentum > 0.0 {
            Zip::from(&mut grads.dw_sq_sum)
                .and(&grads.dw)
                .for_each(|sq, &d| *sq = adam_beta * *sq + (1.0 - adam_beta) * d * d);
            let step = learning_rate * (1.0 - momentum);
            Zip::from(&mut grads.updates)
                .and(&grads.dw)
                .for_each(|u, &d| *u = momentum * *u + step * d);
            let epsilon = learning_rate * ADAM_EPSILON;
            Zip::from(&mut self.wf)
                .and(&grads.updates)
                .and(&grads.dw_sq_sum)
                .for_each(|w, &u, &sq| *w += u / (sq.sqrt() + epsilon));
        } else {
            Zip::from(&mut grads.updates)
                .and(&grads.dw)
                .for_each(|u, &d| *u += learning_rate * d);
            self.wf += &grads.updates;
            let keep = momentum.max(0.0);
            grads.updates.mapv_inplace(|u| u * keep);
        }
        grads.dw.fill(0.0);
    }
}
