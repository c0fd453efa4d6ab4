//! Structural nodes: they route activations between children and own no weights.

use super::convolve::Convolve;
use super::io::NetworkIO;
use super::scratch::NetworkScratch;
use super::{Layer, Network, UpdateParams};
use crate::{LinescribeError, Result};
use serde::{Deserialize, Serialize};

/// Entry point of a network; checks the input depth and passes it through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    ni: usize,
}

impl Input {
    pub fn new(ni: usize) -> Self {
        Self { ni }
    }
}

impl Layer for Input {
    fn num_inputs(&self) -> usize {
        self.ni
    }

    fn num_outputs(&self) -> usize {
        self.ni
    }

    fn forward(&self, input: &NetworkIO, _scratch: &NetworkScratch) -> NetworkIO {
        assert_eq!(input.depth(), self.ni, "network expects input depth {}, got {}", self.ni, input.depth());
        input.clone()
    }

    fn forward_training(&mut self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        self.forward(input, scratch)
    }

    fn backward(&mut self, deltas: &NetworkIO, _scratch: &NetworkScratch) -> NetworkIO {
        deltas.clone()
    }

    fn spec(&self) -> String {
        format!("I{}", self.ni)
    }
}

/// Children applied one after another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    stack: Vec<Network>,
}

impl Series {
    pub fn new(stack: Vec<Network>) -> Self {
        Self { stack }
    }

    pub fn stack(&self) -> &[Network] {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut [Network] {
        &mut self.stack
    }
}

impl Layer for Series {
    fn num_inputs(&self) -> usize {
        self.stack.first().map_or(0, Network::num_inputs)
    }

    fn num_outputs(&self) -> usize {
        self.stack.last().map_or(0, Network::num_outputs)
    }

    fn forward(&self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        let mut current = input.clone();
        for node in &self.stack {
            current = node.forward(&current, scratch);
            current.zero_invalid_elements();
        }
        current
    }

    fn forward_training(&mut self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        let mut current = input.clone();
        for node in &mut self.stack {
            current = node.forward_training(&current, scratch);
            current.zero_invalid_elements();
        }
        current
    }

    fn backward(&mut self, deltas: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        let mut current = deltas.clone();
        for node in self.stack.iter_mut().rev() {
            current = node.backward(&current, scratch);
            current.zero_invalid_elements();
        }
        current
    }

    fn update(&mut self, params: &UpdateParams) {
        self.stack.iter_mut().for_each(|node| node.update(params));
    }

    fn convert_to_int(&mut self) {
        self.stack.iter_mut().for_each(Network::convert_to_int);
    }

    fn set_enable_training(&mut self, enable: bool) {
        self.stack.iter_mut().for_each(|node| node.set_enable_training(enable));
    }

    fn num_weights(&self) -> usize {
        self.stack.iter().map(Network::num_weights).sum()
    }

    fn x_scale(&self) -> usize {
        self.stack.iter().map(Network::x_scale).product()
    }

    fn spec(&self) -> String {
        let mut parts = Vec::with_capacity(self.stack.len());
        let mut nodes = self.stack.iter().peekable();
        while let Some(node) = nodes.next() {
            if let Network::Convolve(conv) = node
                && let Some(Network::FullyConnected(fc)) = nodes.peek()
            {
                parts.push(conv_spec(conv, fc.nonlinearity().code(), fc.num_outputs()));
                nodes.next();
                continue;
            }
            parts.push(node.spec());
        }
        format!("[{}]", parts.join(" "))
    }

    fn validate(&self) -> Result<()> {
        if self.stack.is_empty() {
            return Err(LinescribeError::validation("series has no layers"));
        }
        for node in &self.stack {
            node.validate()?;
        }
        for (i, pair) in self.stack.windows(2).enumerate() {
            let (produced, expected) = (pair[0].num_outputs(), pair[1].num_inputs());
            if produced != expected {
                return Err(LinescribeError::validation(format!(
                    "layer {} ({}) outputs depth {} but layer {} ({}) expects {}",
                    i,
                    pair[0].spec(),
                    produced,
                    i + 1,
                    pair[1].spec(),
                    expected
                )));
            }
        }
        Ok(())
    }
}

fn conv_spec(conv: &Convolve, nl: char, no: usize) -> String {
    let window = conv.num_outputs() / conv.num_inputs().max(1);
    format!("C{nl}{window},{no}")
}

/// Children fed the same input; outputs concatenated along depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parallel {
    branches: Vec<Network>,
}

impl Parallel {
    pub fn new(branches: Vec<Network>) -> Self {
        Self { branches }
    }

    pub fn branches(&self) -> &[Network] {
        &self.branches
    }

    pub fn branches_mut(&mut self) -> &mut [Network] {
        &mut self.branches
    }

    /// `Lbx` shorthand: a forward and a reversed LSTM side by side.
    fn bidirectional_states(&self) -> Option<usize> {
        match self.branches.as_slice() {
            [Network::Lstm(fwd), Network::Reversed(rev)] => match rev.inner() {
                Network::Lstm(bwd) if bwd.num_states() == fwd.num_states() => Some(fwd.num_states()),
                _ => None,
            },
            _ => None,
        }
    }
}

impl Layer for Parallel {
    fn num_inputs(&self) -> usize {
        self.branches.first().map_or(0, Network::num_inputs)
    }

    fn num_outputs(&self) -> usize {
        self.branches.iter().map(Network::num_outputs).sum()
    }

    fn forward(&self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        let outputs: Vec<NetworkIO> = self.branches.iter().map(|b| b.forward(input, scratch)).collect();
        NetworkIO::concat_depth(&outputs)
    }

    fn forward_training(&mut self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        let outputs: Vec<NetworkIO> = self
            .branches
            .iter_mut()
            .map(|b| b.forward_training(input, scratch))
            .collect();
        NetworkIO::concat_depth(&outputs)
    }

    fn backward(&mut self, deltas: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        let mut offset = 0;
        let mut total: Option<NetworkIO> = None;
        for branch in &mut self.branches {
            let no = branch.num_outputs();
            let part = deltas.slice_depth(offset, no);
            offset += no;
            let back = branch.backward(&part, scratch);
            match total.as_mut() {
                Some(sum) => sum.add_all(&back),
                None => total = Some(back),
            }
        }
        total.unwrap_or_default()
    }

    fn update(&mut self, params: &UpdateParams) {
        self.branches.iter_mut().for_each(|node| node.update(params));
    }

    fn convert_to_int(&mut self) {
        self.branches.iter_mut().for_each(Network::convert_to_int);
    }

    fn set_enable_training(&mut self, enable: bool) {
        self.branches.iter_mut().for_each(|node| node.set_enable_training(enable));
    }

    fn num_weights(&self) -> usize {
        self.branches.iter().map(Network::num_weights).sum()
    }

    fn x_scale(&self) -> usize {
        self.branches.first().map_or(1, Network::x_scale)
    }

    fn spec(&self) -> String {
        if let Some(ns) = self.bidirectional_states() {
            return format!("Lbx{ns}");
        }
        let inner: Vec<String> = self.branches.iter().map(Network::spec).collect();
        format!("({})", inner.join(" "))
    }

    fn validate(&self) -> Result<()> {
        let Some(first) = self.branches.first() else {
            return Err(LinescribeError::validation("parallel has no branches"));
        };
        for branch in &self.branches {
            branch.validate()?;
            if branch.num_inputs() != first.num_inputs() {
                return Err(LinescribeError::validation(format!(
                    "parallel branches expect different input depths ({} vs {})",
                    first.num_inputs(),
                    branch.num_inputs()
                )));
            }
            if branch.x_scale() != first.x_scale() {
                return Err(LinescribeError::validation(format!(
                    "parallel branches scale time differently ({} vs {})",
                    first.x_scale(),
                    branch.x_scale()
                )));
            }
        }
        Ok(())
    }
}

/// Runs its child on each line reversed along time, then restores the order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reversed {
    inner: Box<Network>,
}

impl Reversed {
    pub fn new(inner: Network) -> Self {
        Self { inner: Box::new(inner) }
    }

    pub fn inner(&self) -> &Network {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut Network {
        &mut self.inner
    }
}

impl Layer for Reversed {
    fn num_inputs(&self) -> usize {
        self.inner.num_inputs()
    }

    fn num_outputs(&self) -> usize {
        self.inner.num_outputs()
    }

    fn forward(&self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        self.inner.forward(&input.reversed_time(), scratch).reversed_time()
    }

    fn forward_training(&mut self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        self.inner.forward_training(&input.reversed_time(), scratch).reversed_time()
    }

    fn backward(&mut self, deltas: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        self.inner.backward(&deltas.reversed_time(), scratch).reversed_time()
    }

    fn update(&mut self, params: &UpdateParams) {
        self.inner.update(params);
    }

    fn convert_to_int(&mut self) {
        self.inner.convert_to_int();
    }

    fn set_enable_training(&mut self, enable: bool) {
        self.inner.set_enable_training(enable);
    }

    fn num_weights(&self) -> usize {
        self.inner.num_weights()
    }

    fn x_scale(&self) -> usize {
        self.inner.x_scale()
    }

    fn spec(&self) -> String {
        match self.inner.as_ref() {
            Network::Lstm(lstm) => format!("Lrx{}", lstm.num_states()),
            other => format!("R{}", other.spec()),
        }
    }

    fn validate(&self) -> Result<()> {
        self.inner.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::functions::Nonlinearity;
    use crate::network::fully_connected::FullyConnected;
    use crate::network::io::StrideMap;
    use crate::network::weights::WeightMatrix;
    use ndarray::array;

    fn scale(factor: f32) -> Network {
        Network::FullyConnected(FullyConnected::with_weights(
            Nonlinearity::Linear,
            WeightMatrix::from_array(array![[factor, 0.0]]),
        ))
    }

    #[test]
    fn test_series_chains_layers() {
        let series = Series::new(vec![Network::Input(Input::new(1)), scale(2.0), scale(3.0)]);
        let out = series.forward(&NetworkIO::from_rows(&[vec![1.0], vec![2.0]]), &NetworkScratch::sequential());
        assert_eq!(out.f(0), &[6.0]);
        assert_eq!(out.f(1), &[12.0]);
    }

    #[test]
    fn test_series_validation_catches_depth_mismatch() {
        let wide = Network::FullyConnected(FullyConnected::with_weights(
            Nonlinearity::Linear,
            WeightMatrix::zeros(3, 1),
        ));
        let series = Series::new(vec![Network::Input(Input::new(1)), wide, scale(1.0)]);
        let err = series.validate().unwrap_err();
        assert!(err.to_string().contains("outputs depth 3"));
    }

    #[test]
    fn test_parallel_concatenates() {
        let parallel = Parallel::new(vec![scale(2.0), scale(-1.0)]);
        assert_eq!(parallel.num_outputs(), 2);
        let out = parallel.forward(&NetworkIO::from_rows(&[vec![1.5]]), &NetworkScratch::sequential());
        assert_eq!(out.f(0), &[3.0, -1.5]);
    }

    #[test]
    fn test_reversed_keeps_padding_positions() {
        let reversed = Reversed::new(scale(1.0));
        let mut input = NetworkIO::new_float(StrideMap::new(vec![2, 3]), 1);
        for (t, v) in [(0, 1.0), (1, 2.0), (3, 3.0), (4, 4.0), (5, 5.0)] {
            input.f_mut(t)[0] = v;
        }
        let out = reversed.forward(&input, &NetworkScratch::sequential());
        assert_eq!(out.f(2), &[0.0]);
        assert_eq!(out.f(0), &[1.0]);
        assert_eq!(out.f(5), &[5.0]);
    }

    #[test]
    fn test_parallel_backward_sums_branch_deltas() {
        let mut parallel = Parallel::new(vec![scale(2.0), scale(3.0)]);
        parallel.set_enable_training(true);
        let scratch = NetworkScratch::sequential();
        parallel.forward_training(&NetworkIO::from_rows(&[vec![1.0]]), &scratch);
        let back = parallel.backward(&NetworkIO::from_rows(&[vec![1.0, 1.0]]), &scratch);
        assert_eq!(back.f(0), &[5.0]);
    }
}
