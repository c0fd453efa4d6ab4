//! Nonlinearities and their derivatives.

use serde::{Deserialize, Serialize};

/// Inputs to `tanh`/`logistic` are clipped to this range before evaluation.
const MAX_INPUT: f32 = 16.0;

/// Activation applied by a fully-connected layer.
///
/// The set is closed: deserializing any other tag fails, so a layer with an
/// unknown activation cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nonlinearity {
    /// `1 / (1 + e^-x)`
    Logistic,
    /// Linear approximation of the logistic, clipped to `[0, 1]`.
    PosClip,
    /// Linear approximation of `tanh`, clipped to `[-1, 1]`.
    SymClip,
    Tanh,
    Relu,
    Linear,
    /// Softmax over the output depth, trained with CTC alignment.
    Softmax,
    /// Softmax over the output depth, trained per timestep.
    SoftmaxNoCtc,
}

impl Nonlinearity {
    /// The letter used in network descriptions.
    pub fn code(&self) -> char {
        match self {
            Nonlinearity::Logistic => 's',
            Nonlinearity::PosClip => 'p',
            Nonlinearity::SymClip => 'y',
            Nonlinearity::Tanh => 't',
            Nonlinearity::Relu => 'r',
            Nonlinearity::Linear => 'l',
            Nonlinearity::Softmax | Nonlinearity::SoftmaxNoCtc => 'm',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            's' => Some(Nonlinearity::Logistic),
            'p' => Some(Nonlinearity::PosClip),
            'y' => Some(Nonlinearity::SymClip),
            't' => Some(Nonlinearity::Tanh),
            'r' => Some(Nonlinearity::Relu),
            'l' => Some(Nonlinearity::Linear),
            'm' => Some(Nonlinearity::Softmax),
            _ => None,
        }
    }

    pub fn is_softmax(&self) -> bool {
        matches!(self, Nonlinearity::Softmax | Nonlinearity::SoftmaxNoCtc)
    }

    /// Apply the activation in place to one timestep of pre-activations.
    pub fn apply(&self, values: &mut [f32]) {
        match self {
            Nonlinearity::Logistic => values.iter_mut().for_each(|v| *v = logistic(*v)),
            Nonlinearity::PosClip => values.iter_mut().for_each(|v| *v = v.clamp(0.0, 1.0)),
            Nonlinearity::SymClip => values.iter_mut().for_each(|v| *v = v.clamp(-1.0, 1.0)),
            Nonlinearity::Tanh => values.iter_mut().for_each(|v| *v = tanh(*v)),
            Nonlinearity::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
            Nonlinearity::Linear => {}
            Nonlinearity::Softmax | Nonlinearity::SoftmaxNoCtc => softmax_in_place(values),
        }
    }

    /// Multiply `errors` by the activation derivative, given the activation outputs.
    ///
    /// Softmax errors arrive already expressed against the pre-activation
    /// (cross-entropy gradient), so they pass through unchanged.
    pub fn backprop(&self, outputs: &[f32], errors: &mut [f32]) {
        for (e, &y) in errors.iter_mut().zip(outputs) {
            *e *= match self {
                Nonlinearity::Logistic => y * (1.0 - y),
                Nonlinearity::PosClip => clip_derivative(y, 0.0, 1.0),
                Nonlinearity::SymClip => clip_derivative(y, -1.0, 1.0),
                Nonlinearity::Tanh => 1.0 - y * y,
                Nonlinearity::Relu => {
                    if y > 0.0 {
                        1.0
                    } else {
                        0.0
                    }
                }
                Nonlinearity::Linear | Nonlinearity::Softmax | Nonlinearity::SoftmaxNoCtc => 1.0,
            };
        }
    }
}

#[inline]
fn clip_derivative(y: f32, lo: f32, hi: f32) -> f32 {
    if y > lo && y < hi { 1.0 } else { 0.0 }
}

#[inline]
pub fn tanh(x: f32) -> f32 {
    x.clamp(-MAX_INPUT, MAX_INPUT).tanh()
}

#[inline]
pub fn logistic(x: f32) -> f32 {
    1.0 / (1.0 + (-x.clamp(-MAX_INPUT, MAX_INPUT)).exp())
}

/// Numerically stable softmax.
pub fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }
    let mut sum = 0.0f32;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let mut v = vec![1.0, 2.0, 3.0, -50.0];
        softmax_in_place(&mut v);
        let sum: f32 = v.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(v[2] > v[1] && v[1] > v[0]);
    }

    #[test]
    fn test_clipped_functions() {
        let mut v = vec![-2.0, 0.5, 2.0];
        Nonlinearity::PosClip.apply(&mut v);
        assert_eq!(v, vec![0.0, 0.5, 1.0]);
        let mut v = vec![-2.0, 0.5, 2.0];
        Nonlinearity::SymClip.apply(&mut v);
        assert_eq!(v, vec![-1.0, 0.5, 1.0]);
    }

    #[test]
    fn test_logistic_and_tanh_saturate() {
        assert!((logistic(0.0) - 0.5).abs() < 1e-7);
        assert!(logistic(1000.0) <= 1.0);
        assert!(tanh(-1000.0) >= -1.0);
    }

    #[test]
    fn test_backprop_tanh() {
        let outputs = [0.5f32];
        let mut errors = [2.0f32];
        Nonlinearity::Tanh.backprop(&outputs, &mut errors);
        assert!((errors[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_code_roundtrip() {
        for nl in [
            Nonlinearity::Logistic,
            Nonlinearity::PosClip,
            Nonlinearity::SymClip,
            Nonlinearity::Tanh,
            Nonlinearity::Relu,
            Nonlinearity::Linear,
            Nonlinearity::Softmax,
        ] {
            assert_eq!(Nonlinearity::from_code(nl.code()), Some(nl));
        }
        assert_eq!(Nonlinearity::from_code('q'), None);
    }

    #[test]
    fn test_unknown_tag_fails_to_deserialize() {
        let parsed: std::result::Result<Nonlinearity, _> = serde_json::from_str("\"swish\"");
        assert!(parsed.is_err());
    }
}
