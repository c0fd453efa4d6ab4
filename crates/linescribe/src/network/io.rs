//! Activation buffers passed between network nodes.
//!
//! A [`NetworkIO`] is a time × feature matrix. Several lines of different
//! widths may share one buffer: the [`StrideMap`] records each line's real
//! width, and timestep `t` belongs to line `t / max_width` at position
//! `t % max_width`. Positions past a line's real width are padding and are kept
//! at exactly zero whenever a layer reads them.

use ndarray::Array2;

/// Integer activations are stored as `round(x * INT_SCALE)`.
pub const INT_SCALE: f32 = 127.0;

/// Layout of a batch of lines packed into one activation buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StrideMap {
    widths: Vec<usize>,
    max_width: usize,
}

impl StrideMap {
    /// One line per entry in `widths`, padded to the widest.
    pub fn new(widths: Vec<usize>) -> Self {
        let max_width = widths.iter().copied().max().unwrap_or(0);
        Self { widths, max_width }
    }

    /// A single line of `width` timesteps.
    pub fn single(width: usize) -> Self {
        Self::new(vec![width])
    }

    pub fn batch_size(&self) -> usize {
        self.widths.len()
    }

    pub fn max_width(&self) -> usize {
        self.max_width
    }

    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    /// Real width of line `b`.
    pub fn width(&self, b: usize) -> usize {
        self.widths.get(b).copied().unwrap_or(0)
    }

    /// Total timesteps in the buffer, padding included.
    pub fn num_timesteps(&self) -> usize {
        self.widths.len() * self.max_width
    }

    #[inline]
    pub fn index(&self, b: usize, x: usize) -> usize {
        b * self.max_width + x
    }

    /// Splits a timestep index into (line, position).
    #[inline]
    pub fn position(&self, t: usize) -> (usize, usize) {
        if self.max_width == 0 {
            return (0, 0);
        }
        (t / self.max_width, t % self.max_width)
    }

    /// Whether timestep `t` holds real data rather than padding.
    #[inline]
    pub fn is_valid(&self, t: usize) -> bool {
        let (b, x) = self.position(t);
        x < self.width(b)
    }

    /// Layout after shrinking the time axis by `factor` (rounding up).
    pub fn reduced(&self, factor: usize) -> StrideMap {
        let factor = factor.max(1);
        StrideMap::new(self.widths.iter().map(|w| w.div_ceil(factor)).collect())
    }
}

/// Time × feature activations, float or quantized.
#[derive(Debug, Clone)]
pub struct NetworkIO {
    f: Array2<f32>,
    i: Array2<i8>,
    int_mode: bool,
    stride: StrideMap,
}

impl Default for NetworkIO {
    fn default() -> Self {
        Self::new_float(StrideMap::default(), 0)
    }
}

impl NetworkIO {
    /// Zero-filled float buffer.
    pub fn new_float(stride: StrideMap, depth: usize) -> Self {
        Self {
            f: Array2::zeros((stride.num_timesteps(), depth)),
            i: Array2::zeros((0, 0)),
            int_mode: false,
            stride,
        }
    }

    /// Zero-filled quantized buffer.
    pub fn new_int(stride: StrideMap, depth: usize) -> Self {
        Self {
            f: Array2::zeros((0, 0)),
            i: Array2::zeros((stride.num_timesteps(), depth)),
            int_mode: true,
            stride,
        }
    }

    /// Single-line float buffer from one row per timestep.
    ///
    /// # Panics
    ///
    /// Panics if the rows have different lengths.
    pub fn from_rows(rows: &[Vec<f32>]) -> Self {
        let depth = rows.first().map(Vec::len).unwrap_or(0);
        let mut io = Self::new_float(StrideMap::single(rows.len()), depth);
        for (t, row) in rows.iter().enumerate() {
            assert_eq!(row.len(), depth, "ragged rows passed to NetworkIO::from_rows");
            io.f_mut(t).copy_from_slice(row);
        }
        io
    }

    /// Single-line float buffer wrapping an existing matrix.
    pub fn from_array(array: Array2<f32>) -> Self {
        let width = array.nrows();
        let array = if array.is_standard_layout() {
            array
        } else {
            array.as_standard_layout().into_owned()
        };
        Self {
            f: array,
            i: Array2::zeros((0, 0)),
            int_mode: false,
            stride: StrideMap::single(width),
        }
    }

    pub fn int_mode(&self) -> bool {
        self.int_mode
    }

    /// Number of timesteps, padding included.
    pub fn width(&self) -> usize {
        self.stride.num_timesteps()
    }

    pub fn depth(&self) -> usize {
        if self.int_mode { self.i.ncols() } else { self.f.ncols() }
    }

    pub fn stride_map(&self) -> &StrideMap {
        &self.stride
    }

    #[inline]
    pub fn is_valid(&self, t: usize) -> bool {
        self.stride.is_valid(t)
    }

    /// Float activations at timestep `t`.
    #[inline]
    pub fn f(&self, t: usize) -> &[f32] {
        let d = self.f.ncols();
        &flat(&self.f)[t * d..(t + 1) * d]
    }

    #[inline]
    pub fn f_mut(&mut self, t: usize) -> &mut [f32] {
        let d = self.f.ncols();
        &mut flat_mut(&mut self.f)[t * d..(t + 1) * d]
    }

    /// Quantized activations at timestep `t`.
    #[inline]
    pub fn i(&self, t: usize) -> &[i8] {
        let d = self.i.ncols();
        &flat(&self.i)[t * d..(t + 1) * d]
    }

    #[inline]
    pub fn i_mut(&mut self, t: usize) -> &mut [i8] {
        let d = self.i.ncols();
        &mut flat_mut(&mut self.i)[t * d..(t + 1) * d]
    }

    /// All float activations, time-major.
    pub fn float_data(&self) -> &[f32] {
        flat(&self.f)
    }

    pub fn float_data_mut(&mut self) -> &mut [f32] {
        flat_mut(&mut self.f)
    }

    pub fn float_array(&self) -> &Array2<f32> {
        &self.f
    }

    /// Float view of timestep `t` regardless of the storage mode.
    pub fn read_float(&self, t: usize, out: &mut Vec<f32>) {
        out.clear();
        if self.int_mode {
            out.extend(self.i(t).iter().map(|&v| f32::from(v) / INT_SCALE));
        } else {
            out.extend_from_slice(self.f(t));
        }
    }

    /// Quantized view of timestep `t` regardless of the storage mode.
    pub fn read_int(&self, t: usize, out: &mut Vec<i8>) {
        out.clear();
        if self.int_mode {
            out.extend_from_slice(self.i(t));
        } else {
            out.extend(self.f(t).iter().map(|&v| quantize(v)));
        }
    }

    /// Zero every padding timestep.
    pub fn zero_invalid_elements(&mut self) {
        for t in 0..self.width() {
            if !self.stride.is_valid(t) {
                self.zero_timestep(t);
            }
        }
    }

    pub fn zero_timestep(&mut self, t: usize) {
        if self.int_mode {
            self.i_mut(t).fill(0);
        } else {
            self.f_mut(t).fill(0.0);
        }
    }

    /// Quantized copy of this buffer.
    pub fn to_int(&self) -> NetworkIO {
        if self.int_mode {
            return self.clone();
        }
        let mut out = NetworkIO::new_int(self.stride.clone(), self.depth());
        for (dst, &src) in flat_mut(&mut out.i).iter_mut().zip(flat(&self.f)) {
            *dst = quantize(src);
        }
        out
    }

    /// Float copy of this buffer.
    pub fn to_float(&self) -> NetworkIO {
        if !self.int_mode {
            return self.clone();
        }
        let mut out = NetworkIO::new_float(self.stride.clone(), self.depth());
        for (dst, &src) in flat_mut(&mut out.f).iter_mut().zip(flat(&self.i)) {
            *dst = f32::from(src) / INT_SCALE;
        }
        out
    }

    /// Copy with each line's valid region reversed along time.
    ///
    /// Padding stays at the end of each line so the reversed buffer keeps the
    /// same stride map.
    pub fn reversed_time(&self) -> NetworkIO {
        let mut out = if self.int_mode {
            NetworkIO::new_int(self.stride.clone(), self.depth())
        } else {
            NetworkIO::new_float(self.stride.clone(), self.depth())
        };
        for b in 0..self.stride.batch_size() {
            let w = self.stride.width(b);
            for x in 0..w {
                let src = self.stride.index(b, x);
                let dst = self.stride.index(b, w - 1 - x);
                if self.int_mode {
                    out.i_mut(dst).copy_from_slice(self.i(src));
                } else {
                    out.f_mut(dst).copy_from_slice(self.f(src));
                }
            }
        }
        out
    }

    /// Concatenate float buffers along the feature axis.
    ///
    /// # Panics
    ///
    /// Panics if the parts disagree on their stride maps.
    pub fn concat_depth(parts: &[NetworkIO]) -> NetworkIO {
        let Some(first) = parts.first() else {
            return NetworkIO::default();
        };
        let total: usize = parts.iter().map(NetworkIO::depth).sum();
        let mut out = NetworkIO::new_float(first.stride.clone(), total);
        let floats: Vec<NetworkIO> = parts
            .iter()
            .map(|part| {
                assert_eq!(part.stride, first.stride, "parallel branches produced different widths");
                part.to_float()
            })
            .collect();
        for t in 0..out.width() {
            let mut offset = 0;
            for part in &floats {
                let d = part.depth();
                out.f_mut(t)[offset..offset + d].copy_from_slice(part.f(t));
                offset += d;
            }
        }
        out
    }

    /// Feature range `[start, start + depth)` as a new float buffer.
    pub fn slice_depth(&self, start: usize, depth: usize) -> NetworkIO {
        let src = self.to_float();
        let mut out = NetworkIO::new_float(self.stride.clone(), depth);
        for t in 0..out.width() {
            out.f_mut(t).copy_from_slice(&src.f(t)[start..start + depth]);
        }
        out
    }

    /// Label with the highest activation at `t` and its value.
    pub fn best_label(&self, t: usize) -> (usize, f32) {
        let mut best = (0usize, f32::NEG_INFINITY);
        for (label, &v) in self.f(t).iter().enumerate() {
            if v > best.1 {
                best = (label, v);
            }
        }
        best
    }

    /// Add `other` into this buffer element-wise.
    pub fn add_all(&mut self, other: &NetworkIO) {
        let other = other.to_float();
        for (dst, &src) in flat_mut(&mut self.f).iter_mut().zip(flat(&other.f)) {
            *dst += src;
        }
    }

    /// Maximum absolute difference between two float buffers of equal shape.
    pub fn max_abs_diff(&self, other: &NetworkIO) -> f32 {
        let a = self.to_float();
        let b = other.to_float();
        flat(&a.f)
            .iter()
            .zip(flat(&b.f))
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }
}

#[inline]
pub(crate) fn quantize(v: f32) -> i8 {
    (v * INT_SCALE).round().clamp(-INT_SCALE, INT_SCALE) as i8
}

/// Contiguous storage of a matrix built by this crate.
///
/// Every matrix here is created row-major and never re-strided.
#[inline]
pub(crate) fn flat<T>(m: &Array2<T>) -> &[T] {
    debug_assert!(m.is_standard_layout());
    m.as_slice().unwrap_or_default()
}

#[inline]
pub(crate) fn flat_mut<T>(m: &mut Array2<T>) -> &mut [T] {
    debug_assert!(m.is_standard_layout());
    m.as_slice_mut().unwrap_or_default()
}
