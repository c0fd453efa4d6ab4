//! Weightless layers that reshape the time axis.

use super::io::{NetworkIO, StrideMap};
use super::scratch::NetworkScratch;
use super::Layer;
use serde::{Deserialize, Serialize};

/// Stacks a window of `2·half_width + 1` neighbouring timesteps into depth.
///
/// Neighbours outside the line read as zero. Usually followed by a
/// fully-connected layer, which together form a 1-D convolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Convolve {
    ni: usize,
    half_width: usize,
}

impl Convolve {
    pub fn new(ni: usize, half_width: usize) -> Self {
        Self { ni, half_width }
    }

    fn window(&self) -> usize {
        2 * self.half_width + 1
    }

    /// Source positions of each window slot around `x`, `None` when outside the line.
    fn sources(&self, x: usize, width: usize) -> impl Iterator<Item = Option<usize>> + '_ {
        (0..self.window()).map(move |k| {
            let src = (x + k).checked_sub(self.half_width)?;
            (src < width).then_some(src)
        })
    }
}

impl Layer for Convolve {
    fn num_inputs(&self) -> usize {
        self.ni
    }

    fn num_outputs(&self) -> usize {
        self.ni * self.window()
    }

    fn forward(&self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        assert_eq!(input.depth(), self.ni, "convolve expects {} inputs, got {}", self.ni, input.depth());
        let input = input.to_float();
        let stride = input.stride_map().clone();
        let ni = self.ni;
        let mut output = NetworkIO::new_float(stride.clone(), self.num_outputs());
        scratch.for_each_timestep(output.float_data_mut(), ni * self.window(), |t, row, _| {
            if !stride.is_valid(t) {
                return;
            }
            let (b, x) = stride.position(t);
            for (k, src) in self.sources(x, stride.width(b)).enumerate() {
                if let Some(src) = src {
                    row[k * ni..(k + 1) * ni].copy_from_slice(input.f(stride.index(b, src)));
                }
            }
        });
        output
    }

    fn forward_training(&mut self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        self.forward(input, scratch)
    }

    fn backward(&mut self, deltas: &NetworkIO, _scratch: &NetworkScratch) -> NetworkIO {
        let deltas = deltas.to_float();
        let stride = deltas.stride_map().clone();
        let ni = self.ni;
        let mut back = NetworkIO::new_float(stride.clone(), ni);
        for b in 0..stride.batch_size() {
            let width = stride.width(b);
            for x in 0..width {
                let t = stride.index(b, x);
                for (k, src) in self.sources(x, width).enumerate() {
                    if let Some(src) = src {
                        let dst = back.f_mut(stride.index(b, src));
                        for (d, &e) in dst.iter_mut().zip(&deltas.f(t)[k * ni..(k + 1) * ni]) {
                            *d += e;
                        }
                    }
                }
            }
        }
        back
    }

    fn spec(&self) -> String {
        format!("Cx{}", self.window())
    }
}

/// Keeps the maximum of each feature over non-overlapping groups of `x` timesteps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Maxpool {
    ni: usize,
    x: usize,
    #[serde(skip)]
    argmax: Option<(StrideMap, Vec<usize>)>,
}

impl Maxpool {
    pub fn new(ni: usize, x: usize) -> Self {
        Self {
            ni,
            x: x.max(1),
            argmax: None,
        }
    }

    fn pool(&self, input: &NetworkIO, keep_argmax: bool) -> (NetworkIO, Vec<usize>) {
        assert_eq!(input.depth(), self.ni, "maxpool expects {} inputs, got {}", self.ni, input.depth());
        let input = input.to_float();
        let in_stride = input.stride_map();
        let out_stride = in_stride.reduced(self.x);
        let mut output = NetworkIO::new_float(out_stride.clone(), self.ni);
        let mut argmax = if keep_argmax {
            vec![0usize; out_stride.num_timesteps() * self.ni]
        } else {
            Vec::new()
        };
        for b in 0..out_stride.batch_size() {
            let in_width = in_stride.width(b);
            for ox in 0..out_stride.width(b) {
                let t_out = out_stride.index(b, ox);
                let start = ox * self.x;
                let end = (start + self.x).min(in_width);
                let row = output.f_mut(t_out);
                for d in 0..self.ni {
                    let mut best = (start, f32::NEG_INFINITY);
                    for x in start..end {
                        let v = input.f(in_stride.index(b, x))[d];
                        if v > best.1 {
                            best = (x, v);
                        }
                    }
                    row[d] = best.1;
                    if keep_argmax {
                        argmax[t_out * self.ni + d] = in_stride.index(b, best.0);
                    }
                }
            }
        }
        (output, argmax)
    }
}

impl Layer for Maxpool {
    fn num_inputs(&self) -> usize {
        self.ni
    }

    fn num_outputs(&self) -> usize {
        self.ni
    }

    fn forward(&self, input: &NetworkIO, _scratch: &NetworkScratch) -> NetworkIO {
        self.pool(input, false).0
    }

    fn forward_training(&mut self, input: &NetworkIO, _scratch: &NetworkScratch) -> NetworkIO {
        let (output, argmax) = self.pool(input, true);
        self.argmax = Some((input.stride_map().clone(), argmax));
        output
    }

    fn backward(&mut self, deltas: &NetworkIO, _scratch: &NetworkScratch) -> NetworkIO {
        let Some((in_stride, argmax)) = self.argmax.take() else {
            panic!("maxpool backward called without a training forward pass");
        };
        let deltas = deltas.to_float();
        let mut back = NetworkIO::new_float(in_stride, self.ni);
        for t in 0..deltas.width() {
            if !deltas.is_valid(t) {
                continue;
            }
            for (d, &e) in deltas.f(t).iter().enumerate() {
                let src = argmax[t * self.ni + d];
                back.f_mut(src)[d] += e;
            }
        }
        back
    }

    fn x_scale(&self) -> usize {
        self.x
    }

    fn spec(&self) -> String {
        format!("Mp{}", self.x)
    }
}

/// Stacks groups of `x` consecutive timesteps into depth, shrinking time by `x`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconfig {
    ni: usize,
    x: usize,
    #[serde(skip)]
    input_stride: Option<StrideMap>,
}

impl Reconfig {
    pub fn new(ni: usize, x: usize) -> Self {
        Self {
            ni,
            x: x.max(1),
            input_stride: None,
        }
    }
}

impl Layer for Reconfig {
    fn num_inputs(&self) -> usize {
        self.ni
    }

    fn num_outputs(&self) -> usize {
        self.ni * self.x
    }

    fn forward(&self, input: &NetworkIO, _scratch: &NetworkScratch) -> NetworkIO {
        assert_eq!(input.depth(), self.ni, "reconfig expects {} inputs, got {}", self.ni, input.depth());
        let input = input.to_float();
        let in_stride = input.stride_map();
        let out_stride = in_stride.reduced(self.x);
        let mut output = NetworkIO::new_float(out_stride.clone(), self.num_outputs());
        for b in 0..out_stride.batch_size() {
            let in_width = in_stride.width(b);
            for ox in 0..out_stride.width(b) {
                let row = output.f_mut(out_stride.index(b, ox));
                for k in 0..self.x {
                    let x = ox * self.x + k;
                    if x < in_width {
                        row[k * self.ni..(k + 1) * self.ni].copy_from_slice(input.f(in_stride.index(b, x)));
                    }
                }
            }
        }
        output
    }

    fn forward_training(&mut self, input: &NetworkIO, scratch: &NetworkScratch) -> NetworkIO {
        self.input_stride = Some(input.stride_map().clone());
        self.forward(input, scratch)
    }

    fn backward(&mut self, deltas: &NetworkIO, _scratch: &NetworkScratch) -> NetworkIO {
        let Some(in_stride) = self.input_stride.take() else {
            panic!("reconfig backward called without a training forward pass");
        };
        let deltas = deltas.to_float();
        let out_stride = deltas.stride_map().clone();
        let mut back = NetworkIO::new_float(in_stride.clone(), self.ni);
        for b in 0..out_stride.batch_size() {
            for ox in 0..out_stride.width(b) {
                let row = deltas.f(out_stride.index(b, ox));
                for k in 0..self.x {
                    let x = ox * self.x + k;
                    if x < in_stride.width(b) {
                        back.f_mut(in_stride.index(b, x))
                            .copy_from_slice(&row[k * self.ni..(k + 1) * self.ni]);
                    }
                }
            }
        }
        back
    }

    fn x_scale(&self) -> usize {
        self.x
    }

    fn spec(&self) -> String {
        format!("S{}", self.x)
    }
}
