//! Network evaluator.
//!
//! A model's network is a tree of [`Network`] nodes. Leaves carry weights
//! (fully-connected, LSTM) or reshape the time axis (convolve, maxpool,
//! reconfig); interior nodes route activations (series, parallel, reversed).
//! The set of node kinds is closed, so the tree is a plain enum and every
//! operation is a `match` over it.
//!
//! # Inference and training
//!
//! [`Network::forward`] borrows the tree immutably: one loaded model can be
//! evaluated from many threads at once. Training goes through
//! [`Network::forward_training`], [`Network::backward`] and
//! [`Network::update`], all of which take `&mut self` and keep whatever
//! per-call state the backward pass needs inside the nodes.
//!
//! # Example
//!
//! ```rust
//! use linescribe::network::{Network, NetworkIO, NetworkScratch};
//!
//! let network = Network::from_spec("[I4 Ft8 O1c5]", 42).unwrap();
//! let input = NetworkIO::from_rows(&vec![vec![0.0f32; 4]; 10]);
//! let output = network.forward(&input, &NetworkScratch::sequential());
//! assert_eq!(output.depth(), 5);
//! ```

pub mod combinators;
pub mod convolve;
pub mod fully_connected;
pub mod functions;
pub mod io;
pub mod lstm;
pub mod scratch;
pub mod spec;
pub mod weights;

pub use combinators::{Input, Parallel, Reversed, Series};
pub use convolve::{Convolve, Maxpool, Reconfig};
pub use fully_connected::{FullyConnected, LossType};
pub use functions::Nonlinearity;
pub use io::{NetworkIO, StrideMap};
pub use lstm::Lstm;
pub use scratch::{NetworkScratch, WorkerScratch};
pub use weights::WeightMatrix;

use crate::Result;
use serde::{Deserialize, Serialize};

/// Learning parameters for one weight update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpdateParams {
    pub learning_rate: f32,
    pub momentum: f32,
    pub adam_beta: f32,
    /// Samples seen so far, used for Adam bias correction.
    pub num_samples: u32,
}

impl Default for UpdateParams {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            momentum: 0.5,
            adam_beta: 0.999,
            num_samples: 0,
        }
    }
}

/// Operations shared by every node kind.
///
/// `forward` must zero nothing it did not write: output rows for padding
/// timesteps stay at zero. Depth mismatches between a node and its input are
/// programming errors and panic.
pub trait Layer {
    fn num_inputs(&self) -> usize;

    fn num_outputs(&self) -> usize;

    /// Inference pass.
    fn forward(&self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO;

    /// Forward pass that keeps what `backward` needs when training is enabled.
    fn forward_training(&mut self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO;

    /// Propagate output deltas back to input deltas, accumulating weight gradients.
    ///
    /// # Panics
    ///
    /// Panics unless preceded by `forward_training` on the same node.
    fn backward(&mut self, deltas: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO;

    fn update(&mut self, _params: &UpdateParams) {}

    /// Quantize weights to 8 bits. Quantized nodes are inference-only.
    fn convert_to_int(&mut self) {}

    fn set_enable_training(&mut self, _enable: bool) {}

    fn num_weights(&self) -> usize {
        0
    }

    /// Factor by which this node shrinks the time axis.
    fn x_scale(&self) -> usize {
        1
    }

    /// Description of this node in network-spec syntax.
    fn spec(&self) -> String;

    /// Structural checks that must pass before any forward pass.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Input(Input),
    FullyConnected(FullyConnected),
    Lstm(Lstm),
    Convolve(Convolve),
    Maxpool(Maxpool),
    Reconfig(Reconfig),
    Series(Series),
    Parallel(Parallel),
    Reversed(Reversed),
}

macro_rules! dispatch {
    ($self:expr, $node:ident => $body:expr) => {
        match $self {
            Network::Input($node) => $body,
            Network::FullyConnected($node) => $body,
            Network::Lstm($node) => $body,
            Network::Convolve($node) => $body,
            Network::Maxpool($node) => $body,
            Network::Reconfig($node) => $body,
            Network::Series($node) => $body,
            Network::Parallel($node) => $body,
            Network::Reversed($node) => $body,
        }
    };
}

impl Network {
    /// Build and validate a randomly initialized network from a spec string.
    pub fn from_spec(spec: &str, seed: u64) -> Result<Self> {
        let network = spec::build(spec, seed)?;
        network.validate()?;
        Ok(network)
    }

    pub fn num_inputs(&self) -> usize {
        dispatch!(self, n => n.num_inputs())
    }

    pub fn num_outputs(&self) -> usize {
        dispatch!(self, n => n.num_outputs())
    }

    pub fn forward(&self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        dispatch!(self, n => n.forward(input, scratch))
    }

    pub fn forward_training(&mut self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        dispatch!(self, n => n.forward_training(input, scratch))
    }

    pub fn backward(&mut self, deltas: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        dispatch!(self, n => n.backward(deltas, scratch))
    }

    pub fn update(&mut self, params: &UpdateParams) {
        dispatch!(self, n => n.update(params))
    }

    pub fn convert_to_int(&mut self) {
        dispatch!(self, n => n.convert_to_int())
    }

    pub fn set_enable_training(&mut self, enable: bool) {
        dispatch!(self, n => n.set_enable_training(enable))
    }

    pub fn num_weights(&self) -> usize {
        dispatch!(self, n => n.num_weights())
    }

    pub fn x_scale(&self) -> usize {
        dispatch!(self, n => n.x_scale())
    }

    pub fn spec(&self) -> String {
        dispatch!(self, n => n.spec())
    }

    /// Check weight shapes and depth chaining for the whole tree.
    pub fn validate(&self) -> Result<()> {
        dispatch!(self, n => n.validate())
    }

    /// Enable Adam on every weight matrix in the tree.
    pub fn set_use_adam(&mut self, use_adam: bool) {
        match self {
            Network::FullyConnected(fc) => fc.set_use_adam(use_adam),
            Network::Lstm(lstm) => lstm.set_use_adam(use_adam),
            _ => self.for_each_child_mut(|n| n.set_use_adam(use_adam)),
        }
    }

    fn for_each_child_mut(&mut self, mut f: impl FnMut(&mut Network)) {
        match self {
            Network::Series(series) => series.stack_mut().iter_mut().for_each(&mut f),
            Network::Parallel(parallel) => parallel.branches_mut().iter_mut().for_each(&mut f),
            Network::Reversed(reversed) => f(reversed.inner_mut()),
            _ => {}
        }
    }

    /// The final fully-connected layer, which produces the per-label scores.
    pub fn output_layer(&self) -> Option<&FullyConnected> {
        match self {
            Network::FullyConnected(fc) => Some(fc),
            Network::Series(series) => series.stack().last().and_then(Network::output_layer),
            Network::Reversed(reversed) => reversed.inner().output_layer(),
            _ => None,
        }
    }

    pub fn loss_type(&self) -> LossType {
        self.output_layer().map_or(LossType::None, FullyConnected::loss_type)
    }

    pub fn is_int_mode(&self) -> bool {
        match self {
            Network::FullyConnected(fc) => fc.weights().is_int_mode(),
            Network::Series(series) => series.stack().iter().any(Network::is_int_mode),
            Network::Parallel(parallel) => parallel.branches().iter().any(Network::is_int_mode),
            Network::Reversed(reversed) => reversed.inner().is_int_mode(),
            Network::Lstm(lstm) => lstm.is_int_mode(),
            _ => false,
        }
    }
}
