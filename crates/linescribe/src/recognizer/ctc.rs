//! Connectionist temporal classification targets.
//!
//! The forward-backward recursions run in log space over the label sequence
//! with nulls interleaved (`∅ l1 ∅ l2 … ∅`). The posterior probability of each
//! label at each timestep is the training target; the error signal is
//! `target - output`.

use crate::network::NetworkIO;

const LOG_FLOOR: f64 = -1e30;

#[inline]
fn ln(p: f32) -> f64 {
    if p > 0.0 { f64::from(p).ln() } else { LOG_FLOOR }
}

#[inline]
fn log_add(a: f64, b: f64) -> f64 {
    if a <= LOG_FLOOR {
        return b;
    }
    if b <= LOG_FLOOR {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Result of one alignment.
#[derive(Debug, Clone)]
pub struct CtcErrors {
    /// `target - output`, same shape as the outputs.
    pub errors: NetworkIO,
    /// Negative log likelihood of the labels.
    pub loss: f64,
}

/// Minimum number of timesteps that can emit `labels`.
pub fn min_timesteps(labels: &[u32]) -> usize {
    labels.len() + labels.windows(2).filter(|w| w[0] == w[1]).count()
}

/// CTC errors for softmax `outputs` (first line only) against `labels`.
///
/// Returns `None` when the line is too short to emit the labels.
pub fn compute_errors(outputs: &NetworkIO, labels: &[u32], null_label: usize) -> Option<CtcErrors> {
    let outputs = outputs.to_float();
    let width = outputs.stride_map().width(0);
    let depth = outputs.depth();
    if width < min_timesteps(labels) || width == 0 {
        return None;
    }

    let mut extended = Vec::with_capacity(labels.len() * 2 + 1);
    extended.push(null_label);
    for &label in labels {
        extended.push(label as usize);
        extended.push(null_label);
    }
    let s_len = extended.len();
    let skip_allowed = |s: usize| s >= 2 && extended[s] != null_label && extended[s] != extended[s - 2];

    let mut alpha = vec![LOG_FLOOR; width * s_len];
    let mut beta = vec![LOG_FLOOR; width * s_len];

    alpha[0] = ln(outputs.f(0)[extended[0]]);
    if s_len > 1 {
        alpha[1] = ln(outputs.f(0)[extended[1]]);
    }
    for t in 1..width {
        let probs = outputs.f(t);
        for s in 0..s_len {
            let prev = (t - 1) * s_len;
            let mut sum = alpha[prev + s];
            if s >= 1 {
                sum = log_add(sum, alpha[prev + s - 1]);
            }
            if skip_allowed(s) {
                sum = log_add(sum, alpha[prev + s - 2]);
            }
            alpha[t * s_len + s] = sum + ln(probs[extended[s]]);
        }
    }

    let last = (width - 1) * s_len;
    beta[last + s_len - 1] = ln(outputs.f(width - 1)[extended[s_len - 1]]);
    if s_len > 1 {
        beta[last + s_len - 2] = ln(outputs.f(width - 1)[extended[s_len - 2]]);
    }
    for t in (0..width - 1).rev() {
        let probs = outputs.f(t);
        let next = (t + 1) * s_len;
        for s in (0..s_len).rev() {
            let mut sum = beta[next + s];
            if s + 1 < s_len {
                sum = log_add(sum, beta[next + s + 1]);
            }
            if s + 2 < s_len && skip_allowed(s + 2) {
                sum = log_add(sum, beta[next + s + 2]);
            }
            beta[t * s_len + s] = sum + ln(probs[extended[s]]);
        }
    }

    let mut log_likelihood = alpha[last + s_len - 1];
    if s_len > 1 {
        log_likelihood = log_add(log_likelihood, alpha[last + s_len - 2]);
    }
    if log_likelihood <= LOG_FLOOR / 2.0 {
        return None;
    }

    let mut errors = NetworkIO::new_float(outputs.stride_map().clone(), depth);
    let mut occupancy = vec![LOG_FLOOR; depth];
    for t in 0..width {
        occupancy.fill(LOG_FLOOR);
        let probs = outputs.f(t);
        for (s, &label) in extended.iter().enumerate() {
            let joint = alpha[t * s_len + s] + beta[t * s_len + s] - ln(probs[label]);
            occupancy[label] = log_add(occupancy[label], joint);
        }
        let row = errors.f_mut(t);
        for k in 0..depth {
            let target = if occupancy[k] <= LOG_FLOOR {
                0.0
            } else {
                (occupancy[k] - log_likelihood).exp().min(1.0) as f32
            };
            row[k] = target - probs[k];
        }
    }

    Some(CtcErrors {
        errors,
        loss: -log_likelihood,
    })
}

/// Targets that spread `labels` evenly over the line, for models trained
/// without alignment. Returns `target - output` errors.
pub fn fixed_target_errors(outputs: &NetworkIO, labels: &[u32], null_label: usize) -> NetworkIO {
    let outputs = outputs.to_float();
    let width = outputs.stride_map().width(0);
    let mut errors = NetworkIO::new_float(outputs.stride_map().clone(), outputs.depth());
    for t in 0..width {
        let target = if labels.is_empty() {
            null_label
        } else {
            labels[(t * labels.len() / width).min(labels.len() - 1)] as usize
        };
        let probs = outputs.f(t);
        let row = errors.f_mut(t);
        for (k, e) in row.iter_mut().enumerate() {
            *e = if k == target { 1.0 } else { 0.0 } - probs[k];
        }
    }
    errors
}
