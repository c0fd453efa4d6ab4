//! Fully-connected layer: `y[t] = nl(W · [x[t], 1])` at every timestep.

use super::functions::Nonlinearity;
use super::io::NetworkIO;
use super::scratch::NetworkScratch;
use super::weights::WeightMatrix;
use super::{Layer, UpdateParams};
use crate::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Training objective implied by an output layer's nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossType {
    /// Softmax outputs aligned to the target with CTC.
    Ctc,
    /// Softmax outputs with one target label per timestep.
    Softmax,
    /// Independent per-label logistic outputs.
    Logistic,
    /// Hidden layer; no loss of its own.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullyConnected {
    ni: usize,
    no: usize,
    nonlinearity: Nonlinearity,
    weights: WeightMatrix,
    #[serde(skip)]
    training: bool,
    #[serde(skip)]
    trace: Option<Trace>,
}

#[derive(Debug, Clone)]
struct Trace {
    input: NetworkIO,
    output: NetworkIO,
}

impl FullyConnected {
    /// Randomly initialized layer.
    pub fn new<R: Rng + ?Sized>(ni: usize, no: usize, nonlinearity: Nonlinearity, weight_range: f32, rng: &mut R) -> Self {
        Self::with_weights(nonlinearity, WeightMatrix::random(no, ni, weight_range, rng))
    }

    /// Layer around existing weights; the shape is taken from the matrix.
    pub fn with_weights(nonlinearity: Nonlinearity, weights: WeightMatrix) -> Self {
        Self {
            ni: weights.num_inputs(),
            no: weights.num_outputs(),
            nonlinearity,
            weights,
            training: false,
            trace: None,
        }
    }

    pub fn nonlinearity(&self) -> Nonlinearity {
        self.nonlinearity
    }

    pub fn weights(&self) -> &WeightMatrix {
        &self.weights
    }

    pub fn loss_type(&self) -> LossType {
        match self.nonlinearity {
            Nonlinearity::Softmax => LossType::Ctc,
            Nonlinearity::SoftmaxNoCtc => LossType::Softmax,
            Nonlinearity::Logistic => LossType::Logistic,
            _ => LossType::None,
        }
    }

    /// Use Adam for subsequent weight updates.
    pub fn set_use_adam(&mut self, use_adam: bool) {
        self.weights.set_use_adam(use_adam);
    }
}

impl Layer for FullyConnected {
    fn num_inputs(&self) -> usize {
        self.ni
    }

    fn num_outputs(&self) -> usize {
        self.no
    }

    fn forward(&self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        assert_eq!(
            input.depth(),
            self.ni,
            "fully-connected layer expects {} inputs, got {}",
            self.ni,
            input.depth()
        );
        let mut output = NetworkIO::new_float(input.stride_map().clone(), self.no);
        let dot = scratch.dot_product();
        let weights = &self.weights;
        let nonlinearity = self.nonlinearity;
        scratch.for_each_timestep(output.float_data_mut(), self.no, |t, row, work| {
            if !input.is_valid(t) {
                return;
            }
            if weights.is_int_mode() {
                input.read_int(t, &mut work.ints);
                weights.matrix_dot_vector_int(&work.ints, row);
            } else if input.int_mode() {
                input.read_float(t, &mut work.floats);
                weights.matrix_dot_vector(dot, &work.floats, row);
            } else {
                weights.matrix_dot_vector(dot, input.f(t), row);
            }
            nonlinearity.apply(row);
        });
        output
    }

    fn forward_training(&mut self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        let output = self.forward(input, scratch);
        if self.training {
            self.trace = Some(Trace {
                input: input.to_float(),
                output: output.clone(),
            });
        }
        output
    }

    fn backward(&mut self, deltas: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        let Some(trace) = self.trace.take() else {
            panic!("fully-connected backward called without a training forward pass");
        };
        let mut errors = deltas.to_float();
        let nonlinearity = self.nonlinearity;
        scratch.for_each_timestep(errors.float_data_mut(), self.no, |t, row, _| {
            if trace.output.is_valid(t) {
                nonlinearity.backprop(trace.output.f(t), row);
            } else {
                row.fill(0.0);
            }
        });

        let mut back = NetworkIO::new_float(errors.stride_map().clone(), self.ni);
        let weights = &self.weights;
        scratch.for_each_timestep(back.float_data_mut(), self.ni, |t, row, _| {
            if errors.is_valid(t) {
                weights.vector_dot_matrix(errors.f(t), row);
            }
        });
        self.weights.sum_outer_transposed(&errors, &trace.input, scratch);
        back
    }

    fn update(&mut self, params: &UpdateParams) {
        if self.training {
            self.weights
                .update(params.learning_rate, params.momentum, params.adam_beta, params.num_samples);
        }
    }

    fn convert_to_int(&mut self) {
        self.training = false;
        self.trace = None;
        self.weights.convert_to_int();
    }

    fn set_enable_training(&mut self, enable: bool) {
        self.training = enable;
        if enable {
            self.weights.init_backward();
        } else {
            self.trace = None;
        }
    }

    fn num_weights(&self) -> usize {
        self.weights.num_weights()
    }

    fn spec(&self) -> String {
        match self.loss_type() {
            LossType::Ctc => format!("O1c{}", self.no),
            LossType::Softmax => format!("O1s{}", self.no),
            _ => format!("F{}{}", self.nonlinearity.code(), self.no),
        }
    }

    fn validate(&self) -> Result<()> {
        self.weights.validate(self.no, self.ni)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::io::StrideMap;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn identity_layer() -> FullyConnected {
        FullyConnected::with_weights(
            Nonlinearity::Linear,
            WeightMatrix::from_array(array![[1.0, 0.0, 0.0], [0.0, 2.0, 1.0]]),
        )
    }

    #[test]
    fn test_forward_applies_weights_and_bias() {
        let layer = identity_layer();
        let input = NetworkIO::from_rows(&[vec![3.0, 4.0]]);
        let out = layer.forward(&input, &NetworkScratch::sequential());
        assert_eq!(out.f(0), &[3.0, 9.0]);
    }

    #[test]
    fn test_forward_leaves_padding_zero() {
        let layer = identity_layer();
        let mut input = NetworkIO::new_float(StrideMap::new(vec![1, 2]), 2);
        input.float_data_mut().fill(1.0);
        input.zero_invalid_elements();
        let out = layer.forward(&input, &NetworkScratch::sequential());
        assert_eq!(out.f(1), &[0.0, 0.0]);
        assert_eq!(out.f(2), &[1.0, 3.0]);
    }

    #[test]
    fn test_loss_types() {
        let mut rng = StdRng::seed_from_u64(1);
        let ctc = FullyConnected::new(2, 3, Nonlinearity::Softmax, 0.1, &mut rng);
        assert_eq!(ctc.loss_type(), LossType::Ctc);
        assert_eq!(ctc.spec(), "O1c3");
        let plain = FullyConnected::new(2, 3, Nonlinearity::SoftmaxNoCtc, 0.1, &mut rng);
        assert_eq!(plain.loss_type(), LossType::Softmax);
        let logistic = FullyConnected::new(2, 3, Nonlinearity::Logistic, 0.1, &mut rng);
        assert_eq!(logistic.loss_type(), LossType::Logistic);
        let hidden = FullyConnected::new(2, 3, Nonlinearity::Tanh, 0.1, &mut rng);
        assert_eq!(hidden.loss_type(), LossType::None);
        assert_eq!(hidden.spec(), "Ft3");
    }

    #[test]
    fn test_quantized_forward_is_close() {
        let mut rng = StdRng::seed_from_u64(7);
        let float = FullyConnected::new(8, 4, Nonlinearity::Tanh, 0.5, &mut rng);
        let mut quantized = float.clone();
        quantized.convert_to_int();
        let rows: Vec<Vec<f32>> = (0..5)
            .map(|t| (0..8).map(|i| ((t * 8 + i) as f32 * 0.37).sin()).collect())
            .collect();
        let input = NetworkIO::from_rows(&rows);
        let scratch = NetworkScratch::sequential();
        let a = float.forward(&input, &scratch);
        let b = quantized.forward(&input, &scratch);
        assert!(a.max_abs_diff(&b) < 0.05);
    }

    #[test]
    fn test_forward_accepts_int_input() {
        let mut rng = StdRng::seed_from_u64(11);
        let float = FullyConnected::new(8, 4, Nonlinearity::Tanh, 0.5, &mut rng);
        let mut quantized = float.clone();
        quantized.convert_to_int();
        let rows: Vec<Vec<f32>> = (0..20)
            .map(|t| (0..8).map(|i| ((t * 8 + i) as f32 * 0.21).cos()).collect())
            .collect();
        let input = NetworkIO::from_rows(&rows);
        let int_input = input.to_int();
        assert!(int_input.int_mode());
        let scratch = NetworkScratch::sequential();

        let reference = float.forward(&input, &scratch);
        let from_int = float.forward(&int_input, &scratch);
        assert!(!from_int.int_mode());
        assert!(reference.max_abs_diff(&from_int) < 0.05);

        // Int weights quantize float input the same way to_int does.
        let quantized_float_in = quantized.forward(&input, &scratch);
        let quantized_int_in = quantized.forward(&int_input, &scratch);
        assert_eq!(quantized_float_in.float_data(), quantized_int_in.float_data());
        assert!(reference.max_abs_diff(&quantized_int_in) < 0.05);
    }

    #[test]
    fn test_training_reduces_error() {
        let mut layer = FullyConnected::with_weights(Nonlinearity::Linear, WeightMatrix::zeros(1, 1));
        layer.set_enable_training(true);
        let scratch = NetworkScratch::sequential();
        let input = NetworkIO::from_rows(&[vec![1.0]]);
        let params = UpdateParams {
            learning_rate: 0.1,
            momentum: 0.0,
            adam_beta: 0.999,
            num_samples: 1,
        };
        let mut last_error = f32::INFINITY;
        for _ in 0..10 {
            let out = layer.forward_training(&input, &scratch);
            let error = 2.0 - out.f(0)[0];
            assert!(error.abs() < last_error);
            last_error = error.abs();
            layer.backward(&NetworkIO::from_rows(&[vec![error]]), &scratch);
            layer.update(&params);
        }
    }

    #[test]
    #[should_panic(expected = "expects 2 inputs")]
    fn test_depth_mismatch_is_fatal() {
        let layer = identity_layer();
        layer.forward(&NetworkIO::from_rows(&[vec![1.0]]), &NetworkScratch::sequential());
    }
}
