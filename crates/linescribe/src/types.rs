//! Result records handed to layout and rendering code.

use serde::{Deserialize, Serialize};

/// Axis-aligned box in original-image pixel coordinates; `right` and `bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl BoundingBox {
    pub fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right: right.max(left),
            bottom: bottom.max(top),
        }
    }

    /// Box covering a whole `width` × `height` image.
    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        BoundingBox {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }
}

/// An alternative reading of one symbol position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolChoice {
    pub text: String,
    pub certainty: f32,
    /// Calibrated confidence in `0..=100`.
    pub confidence: f32,
}

/// Top single-label characters at one timestep, with their probabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestepChoices {
    pub timestep: usize,
    pub choices: Vec<(String, f32)>,
}

/// One recognized character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolResult {
    pub text: String,
    pub unichar_id: usize,
    pub bbox: BoundingBox,
    pub certainty: f32,
    pub confidence: f32,
    /// Network timesteps `[start, end)` that produced the character.
    pub start_timestep: usize,
    pub end_timestep: usize,
    /// Ranked alternatives, best first (empty unless requested).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<SymbolChoice>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timesteps: Vec<TimestepChoices>,
}

/// One recognized word.
///
/// A line with nothing recognizable yields a single *fake* word: empty text,
/// the line box, zero confidence and no symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordResult {
    pub text: String,
    pub bbox: BoundingBox,
    /// Lowest symbol certainty.
    pub certainty: f32,
    /// Sum of symbol ratings.
    pub rating: f32,
    pub confidence: f32,
    pub symbols: Vec<SymbolResult>,
    /// Every symbol was decoded inside a dictionary word.
    pub in_dictionary: bool,
    /// The dictionary's final verdict on the word.
    pub accepted: bool,
    pub fake: bool,
}

impl WordResult {
    pub fn fake(bbox: BoundingBox) -> Self {
        Self {
            text: String::new(),
            bbox,
            certainty: crate::beam::MIN_CERTAINTY,
            rating: 0.0,
            confidence: 0.0,
            symbols: Vec::new(),
            in_dictionary: false,
            accepted: false,
            fake: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_ignores_empty_boxes() {
        let a = BoundingBox::new(10, 0, 20, 30);
        let b = BoundingBox::new(25, 5, 40, 28);
        assert_eq!(a.union(&b), BoundingBox::new(10, 0, 40, 30));
        assert_eq!(BoundingBox::default().union(&a), a);
    }

    #[test]
    fn test_new_normalizes_inverted_edges() {
        let bbox = BoundingBox::new(10, 10, 5, 5);
        assert!(bbox.is_empty());
        assert_eq!(bbox.width(), 0);
    }

    #[test]
    fn test_fake_word() {
        let word = WordResult::fake(BoundingBox::from_size(100, 32));
        assert!(word.fake);
        assert!(word.text.is_empty());
        assert_eq!(word.confidence, 0.0);
    }
}
