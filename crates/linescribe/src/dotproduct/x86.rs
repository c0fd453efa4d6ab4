//! x86_64 kernels.
//!
//! Each public function is safe to call only through [`super::DotProduct`],
//! which never dispatches to a kernel whose CPU feature was not detected.
#![allow(unsafe_code)]

use std::arch::x86_64::*;

pub(super) fn dot_sse(a: &[f32], b: &[f32]) -> f32 {
    debug_assert!(std::arch::is_x86_feature_detected!("sse"));
    // SAFETY: dispatch only reaches here after `sse` was detected.
    unsafe { dot_sse_impl(a, b) }
}

pub(super) fn dot_avx(a: &[f32], b: &[f32]) -> f32 {
    debug_assert!(std::arch::is_x86_feature_detected!("avx"));
    // SAFETY: dispatch only reaches here after `avx` was detected.
    unsafe { dot_avx_impl(a, b) }
}

pub(super) fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert!(std::arch::is_x86_feature_detected!("avx2"));
    // SAFETY: dispatch only reaches here after `avx2` was detected.
    unsafe { dot_avx2_impl(a, b) }
}

pub(super) fn dot_fma(a: &[f32], b: &[f32]) -> f32 {
    debug_assert!(std::arch::is_x86_feature_detected!("fma"));
    // SAFETY: dispatch only reaches here after `avx2` and `fma` were detected.
    unsafe { dot_fma_impl(a, b) }
}

#[target_feature(enable = "sse")]
unsafe fn dot_sse_impl(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let blocks = n / 4;
    let mut lanes = [0.0f32; 4];
    unsafe {
        let mut acc = _mm_setzero_ps();
        for i in 0..blocks {
            let va = _mm_loadu_ps(a.as_ptr().add(i * 4));
            let vb = _mm_loadu_ps(b.as_ptr().add(i * 4));
            acc = _mm_add_ps(acc, _mm_mul_ps(va, vb));
        }
        _mm_storeu_ps(lanes.as_mut_ptr(), acc);
    }
    let mut total = (lanes[0] + lanes[2]) + (lanes[1] + lanes[3]);
    for i in blocks * 4..n {
        total += a[i] * b[i];
    }
    total
}

#[target_feature(enable = "avx")]
unsafe fn dot_avx_impl(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let blocks = n / 8;
    let mut lanes = [0.0f32; 8];
    unsafe {
        let mut acc = _mm256_setzero_ps();
        for i in 0..blocks {
            let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
            acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
        }
        _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
    }
    horizontal_sum(&lanes) + tail(a, b, blocks * 8, n)
}

// Two accumulators to hide the add latency; same math as `avx`.
#[target_feature(enable = "avx,avx2")]
unsafe fn dot_avx2_impl(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let pairs = n / 16;
    let mut lanes = [0.0f32; 8];
    let mut done = pairs * 16;
    unsafe {
        let mut acc0 = _mm256_setzero_ps();
        let mut acc1 = _mm256_setzero_ps();
        for i in 0..pairs {
            let base = i * 16;
            let a0 = _mm256_loadu_ps(a.as_ptr().add(base));
            let b0 = _mm256_loadu_ps(b.as_ptr().add(base));
            let a1 = _mm256_loadu_ps(a.as_ptr().add(base + 8));
            let b1 = _mm256_loadu_ps(b.as_ptr().add(base + 8));
            acc0 = _mm256_add_ps(acc0, _mm256_mul_ps(a0, b0));
            acc1 = _mm256_add_ps(acc1, _mm256_mul_ps(a1, b1));
        }
        if n - done >= 8 {
            let a0 = _mm256_loadu_ps(a.as_ptr().add(done));
            let b0 = _mm256_loadu_ps(b.as_ptr().add(done));
            acc0 = _mm256_add_ps(acc0, _mm256_mul_ps(a0, b0));
            done += 8;
        }
        _mm256_storeu_ps(lanes.as_mut_ptr(), _mm256_add_ps(acc0, acc1));
    }
    horizontal_sum(&lanes) + tail(a, b, done, n)
}

#[target_feature(enable = "avx,avx2,fma")]
unsafe fn dot_fma_impl(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let blocks = n / 8;
    let mut lanes = [0.0f32; 8];
    unsafe {
        let mut acc = _mm256_setzero_ps();
        for i in 0..blocks {
            let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
            acc = _mm256_fmadd_ps(va, vb, acc);
        }
        _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
    }
    horizontal_sum(&lanes) + tail(a, b, blocks * 8, n)
}

#[inline]
fn horizontal_sum(lanes: &[f32; 8]) -> f32 {
    ((lanes[0] + lanes[4]) + (lanes[1] + lanes[5])) + ((lanes[2] + lanes[6]) + (lanes[3] + lanes[7]))
}

#[inline]
fn tail(a: &[f32], b: &[f32], start: usize, end: usize) -> f32 {
    let mut total = 0.0f32;
    for i in start..end {
        total += a[i] * b[i];
    }
    total
}
