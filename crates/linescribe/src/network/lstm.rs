//! Long short-term memory layer running left to right along each line.
//!
//! Each timestep sees `[x[t], h[t-1], 1]` and computes four gates:
//!
//! * `ci` cell input (tanh)
//! * `gi` input gate (logistic)
//! * `gf` forget gate (logistic)
//! * `go` output gate (logistic)
//!
//! `c[t] = c[t-1]·gf + ci·gi` (clipped), `h[t] = tanh(c[t])·go`.
//!
//! The recurrence makes the time axis inherently sequential; separate lines
//! of a batch are independent and start from zero state.

use super::functions::{logistic, tanh};
use super::io::{NetworkIO, StrideMap, quantize};
use super::scratch::NetworkScratch;
use super::weights::WeightMatrix;
use super::{Layer, UpdateParams};
use crate::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

const CELL_CLIP: f32 = 100.0;

const CI: usize = 0;
const GI: usize = 1;
const GF: usize = 2;
const GO: usize = 3;
const NUM_GATES: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lstm {
    ni: usize,
    ns: usize,
    gates: [WeightMatrix; NUM_GATES],
    #[serde(skip)]
    training: bool,
    #[serde(skip)]
    trace: Option<Trace>,
}

/// Per-timestep values kept from a training forward pass.
#[derive(Debug, Clone)]
struct Trace {
    /// `[x[t], h[t-1]]`
    concat: NetworkIO,
    gates: [NetworkIO; NUM_GATES],
    cell: NetworkIO,
    cell_tanh: NetworkIO,
}

impl Trace {
    fn new(stride: &StrideMap, ni: usize, ns: usize) -> Self {
        let io = |depth| NetworkIO::new_float(stride.clone(), depth);
        Self {
            concat: io(ni + ns),
            gates: [io(ns), io(ns), io(ns), io(ns)],
            cell: io(ns),
            cell_tanh: io(ns),
        }
    }
}

impl Lstm {
    pub fn new<R: Rng + ?Sized>(ni: usize, ns: usize, weight_range: f32, rng: &mut R) -> Self {
        let gate = |rng: &mut R| WeightMatrix::random(ns, ni + ns, weight_range, rng);
        let gates = [gate(rng), gate(rng), gate(rng), gate(rng)];
        Self {
            ni,
            ns,
            gates,
            training: false,
            trace: None,
        }
    }

    pub fn num_states(&self) -> usize {
        self.ns
    }

    pub fn is_int_mode(&self) -> bool {
        self.gates[CI].is_int_mode()
    }

    pub fn set_use_adam(&mut self, use_adam: bool) {
        for gate in &mut self.gates {
            gate.set_use_adam(use_adam);
        }
    }

    fn forward_impl(&self, input: &NetworkIO, scratch: &NetworkScratch, mut trace: Option<&mut Trace>) -> NetworkIO {
        assert_eq!(
            input.depth(),
            self.ni,
            "LSTM expects {} inputs, got {}",
            self.ni,
            input.depth()
        );
        let (ni, ns) = (self.ni, self.ns);
        let stride = input.stride_map().clone();
        let mut output = NetworkIO::new_float(stride.clone(), ns);
        let dot = scratch.dot_product();
        let int_mode = self.gates[CI].is_int_mode();

        let mut work = scratch.acquire();
        let mut concat = vec![0.0f32; ni + ns];
        let mut concat_int = vec![0i8; ni + ns];
        let mut gate_out = [vec![0.0f32; ns], vec![0.0f32; ns], vec![0.0f32; ns], vec![0.0f32; ns]];
        let mut cell = vec![0.0f32; ns];

        for b in 0..stride.batch_size() {
            concat[ni..].fill(0.0);
            cell.fill(0.0);
            for x in 0..stride.width(b) {
                let t = stride.index(b, x);
                input.read_float(t, &mut work.floats);
                concat[..ni].copy_from_slice(&work.floats);

                if int_mode {
                    for (q, &v) in concat_int.iter_mut().zip(&concat) {
                        *q = quantize(v);
                    }
                    for (g, out) in gate_out.iter_mut().enumerate() {
                        self.gates[g].matrix_dot_vector_int(&concat_int, out);
                    }
                } else {
                    for (g, out) in gate_out.iter_mut().enumerate() {
                        self.gates[g].matrix_dot_vector(dot, &concat, out);
                    }
                }
                gate_out[CI].iter_mut().for_each(|v| *v = tanh(*v));
                for g in [GI, GF, GO] {
                    gate_out[g].iter_mut().for_each(|v| *v = logistic(*v));
                }

                if let Some(trace) = trace.as_deref_mut() {
                    trace.concat.f_mut(t).copy_from_slice(&concat);
                }

                let h = output.f_mut(t);
                for s in 0..ns {
                    let c = cell[s] * gate_out[GF][s] + gate_out[CI][s] * gate_out[GI][s];
                    cell[s] = c.clamp(-CELL_CLIP, CELL_CLIP);
                    h[s] = tanh(cell[s]) * gate_out[GO][s];
                }
                concat[ni..].copy_from_slice(h);

                if let Some(trace) = trace.as_deref_mut() {
                    for (g, out) in gate_out.iter().enumerate() {
                        trace.gates[g].f_mut(t).copy_from_slice(out);
                    }
                    trace.cell.f_mut(t).copy_from_slice(&cell);
                    for (dst, &c) in trace.cell_tanh.f_mut(t).iter_mut().zip(&cell) {
                        *dst = tanh(c);
                    }
                }
            }
        }
        output
    }
}

impl Layer for Lstm {
    fn num_inputs(&self) -> usize {
        self.ni
    }

    fn num_outputs(&self) -> usize {
        self.ns
    }

    fn forward(&self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        self.forward_impl(input, scratch, None)
    }

    fn forward_training(&mut self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        if !self.training {
            return self.forward_impl(input, scratch, None);
        }
        let mut trace = Trace::new(input.stride_map(), self.ni, self.ns);
        let output = self.forward_impl(input, scratch, Some(&mut trace));
        self.trace = Some(trace);
        output
    }

    /// Back-propagation through time, newest timestep first.
    fn backward(&mut self, deltas: &NetworkIO, _scratch: &NetworkScratch) -> NetworkIO {
        let Some(trace) = self.trace.take() else {
            panic!("LSTM backward called without a training forward pass");
        };
        let (ni, ns) = (self.ni, self.ns);
        let deltas = deltas.to_float();
        let stride = deltas.stride_map().clone();
        let mut back = NetworkIO::new_float(stride.clone(), ni);

        let mut dh_next = vec![0.0f32; ns];
        let mut dc_next = vec![0.0f32; ns];
        let mut d_gate = [vec![0.0f32; ns], vec![0.0f32; ns], vec![0.0f32; ns], vec![0.0f32; ns]];
        let mut d_concat = vec![0.0f32; ni + ns];
        let mut d_part = vec![0.0f32; ni + ns];

        for b in 0..stride.batch_size() {
            dh_next.fill(0.0);
            dc_next.fill(0.0);
            for x in (0..stride.width(b)).rev() {
                let t = stride.index(b, x);
                let ci = trace.gates[CI].f(t);
                let gi = trace.gates[GI].f(t);
                let gf = trace.gates[GF].f(t);
                let go = trace.gates[GO].f(t);
                let cell_tanh = trace.cell_tanh.f(t);
                let prev_cell = (x > 0).then(|| trace.cell.f(t - 1));

                for s in 0..ns {
                    let dh = deltas.f(t)[s] + dh_next[s];
                    let dc = dh * go[s] * (1.0 - cell_tanh[s] * cell_tanh[s]) + dc_next[s];
                    let c_prev = prev_cell.map_or(0.0, |c| c[s]);
                    d_gate[GO][s] = dh * cell_tanh[s] * go[s] * (1.0 - go[s]);
                    d_gate[GI][s] = dc * ci[s] * gi[s] * (1.0 - gi[s]);
                    d_gate[GF][s] = dc * c_prev * gf[s] * (1.0 - gf[s]);
                    d_gate[CI][s] = dc * gi[s] * (1.0 - ci[s] * ci[s]);
                    dc_next[s] = dc * gf[s];
                }

                d_concat.fill(0.0);
                let concat = trace.concat.f(t);
                for (g, gate) in self.gates.iter_mut().enumerate() {
                    gate.vector_dot_matrix(&d_gate[g], &mut d_part);
                    for (acc, &d) in d_concat.iter_mut().zip(&d_part) {
                        *acc += d;
                    }
                    gate.accumulate_outer(&d_gate[g], concat);
                }
                back.f_mut(t).copy_from_slice(&d_concat[..ni]);
                dh_next.copy_from_slice(&d_concat[ni..]);
            }
        }
        back
    }

    fn update(&mut self, params: &UpdateParams) {
        if self.training {
            for gate in &mut self.gates {
                gate.update(params.learning_rate, params.momentum, params.adam_beta, params.num_samples);
            }
        }
    }

    fn convert_to_int(&mut self) {
        self.training = false;
        self.trace = None;
        for gate in &mut self.gates {
            gate.convert_to_int();
        }
    }

    fn set_enable_training(&mut self, enable: bool) {
        self.training = enable;
        if enable {
            for gate in &mut self.gates {
                gate.init_backward();
            }
        } else {
            self.trace = None;
        }
    }

    fn num_weights(&self) -> usize {
        self.gates.iter().map(WeightMatrix::num_weights).sum()
    }

    fn spec(&self) -> String {
        format!("Lfx{}", self.ns)
    }

    fn validate(&self) -> Result<()> {
        for gate in &self.gates {
            gate.validate(self.ns, self.ni + self.ns)?;
        }
        Ok(())
    }
}
