//! Mapping certainties (log probabilities) onto a 0-100 confidence scale.

/// Factor that stretches LSTM certainties onto the legacy classifier's range.
pub const LEGACY_CERTAINTY_SCALE: f32 = 7.0;

/// Converts a certainty into a confidence in `0..=100`.
pub trait CertaintyCalibration: Send + Sync + std::fmt::Debug {
    fn confidence(&self, certainty: f32) -> f32;
}

/// `clamp(100 + 5c, 0, 100)`, optionally after stretching `c` by
/// [`LEGACY_CERTAINTY_SCALE`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinearCalibration {
    pub rescale: bool,
}

impl LinearCalibration {
    pub fn new(rescale: bool) -> Self {
        Self { rescale }
    }
}

impl CertaintyCalibration for LinearCalibration {
    fn confidence(&self, certainty: f32) -> f32 {
        let certainty = if self.rescale {
            certainty * LEGACY_CERTAINTY_SCALE
        } else {
            certainty
        };
        (100.0 + 5.0 * certainty).clamp(0.0, 100.0)
    }
}
