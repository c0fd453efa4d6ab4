//! Portable kernels.

/// Straight left-to-right sum. The reference every other kernel is checked against.
#[inline]
pub(super) fn dot_generic(a: &[f32], b: &[f32]) -> f32 {
    let mut total = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        total += x * y;
    }
    total
}

const LANES: usize = 8;

/// Eight independent accumulators; the optimizer maps them onto vector registers.
#[inline]
pub(super) fn dot_native(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; LANES];
    let a_chunks = a.chunks_exact(LANES);
    let b_chunks = b.chunks_exact(LANES);
    let a_tail = a_chunks.remainder();
    let b_tail = b_chunks.remainder();

    for (ca, cb) in a_chunks.zip(b_chunks) {
        for lane in 0..LANES {
            acc[lane] += ca[lane] * cb[lane];
        }
    }

    let mut total = (acc[0] + acc[4]) + (acc[1] + acc[5]) + (acc[2] + acc[6]) + (acc[3] + acc[7]);
    for (x, y) in a_tail.iter().zip(b_tail) {
        total += x * y;
    }
    total
}

#[inline]
pub(super) fn dot_i8(a: &[i8], b: &[i8]) -> i32 {
    a.iter().zip(b).map(|(&x, &y)| i32::from(x) * i32::from(y)).sum()
}
