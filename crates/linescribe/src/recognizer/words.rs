//! Decoded paths to word records with image-space boxes.

use super::calibration::CertaintyCalibration;
use crate::beam::{DecodedChar, DecodedPath, Dictionary, TimestepChoice};
use crate::recoder::{SPACE_ID, Unicharset};
use crate::types::{BoundingBox, SymbolChoice, SymbolResult, TimestepChoices, WordResult};

/// Geometry and lookup tables shared by every word of a line.
pub(crate) struct WordBuilder<'a> {
    pub unicharset: &'a Unicharset,
    pub calibration: &'a dyn CertaintyCalibration,
    pub dictionary: Option<&'a dyn Dictionary>,
    pub line_box: BoundingBox,
    /// Image pixels (after scaling) per network timestep.
    pub x_scale: usize,
    /// Scaled width over original width.
    pub scale: f32,
    pub scaled_width: usize,
}

impl WordBuilder<'_> {
    /// Pixel columns of the original image covered by timesteps `[start, end)`.
    fn columns(&self, start: usize, end: usize) -> (u32, u32) {
        let scale = if self.scale > 0.0 { self.scale } else { 1.0 };
        let to_original = |t: usize| (t * self.x_scale).min(self.scaled_width) as f32 / scale;
        let width = self.line_box.width();
        let left = (to_original(start).floor() as u32).min(width);
        let right = (to_original(end).ceil() as u32).clamp(left, width);
        (self.line_box.left + left, self.line_box.left + right)
    }

    fn text(&self, unichar_id: usize) -> String {
        self.unicharset.get(unichar_id).unwrap_or_default().to_string()
    }

    fn symbol(&self, ch: &DecodedChar) -> SymbolResult {
        let (left, right) = self.columns(ch.start, ch.end);
        SymbolResult {
            text: self.text(ch.unichar_id),
            unichar_id: ch.unichar_id,
            bbox: BoundingBox::new(left, self.line_box.top, right, self.line_box.bottom),
            certainty: ch.certainty,
            confidence: self.calibration.confidence(ch.certainty),
            start_timestep: ch.start,
            end_timestep: ch.end,
            choices: Vec::new(),
            timesteps: Vec::new(),
        }
    }

    /// Split `path` on spaces into words.
    ///
    /// `choices` and `timesteps`, when given, are indexed like `path.chars`.
    pub fn build(
        &self,
        path: &DecodedPath,
        choices: Option<&[Vec<(usize, f32)>]>,
        timesteps: Option<&[Vec<TimestepChoice>]>,
    ) -> Vec<WordResult> {
        let mut words = Vec::new();
        let mut current: Vec<(usize, &DecodedChar)> = Vec::new();
        for (index, ch) in path.chars.iter().enumerate() {
            if ch.unichar_id == SPACE_ID {
                if !current.is_empty() {
                    words.push(self.word(&current, choices, timesteps));
                    current.clear();
                }
            } else {
                current.push((index, ch));
            }
        }
        if !current.is_empty() {
            words.push(self.word(&current, choices, timesteps));
        }
        words
    }

    fn word(
        &self,
        chars: &[(usize, &DecodedChar)],
        choices: Option<&[Vec<(usize, f32)>]>,
        timesteps: Option<&[Vec<TimestepChoice>]>,
    ) -> WordResult {
        let mut symbols = Vec::with_capacity(chars.len());
        for &(index, ch) in chars {
            let mut symbol = self.symbol(ch);
            if let Some(alternatives) = choices.and_then(|c| c.get(index)) {
                symbol.choices = alternatives
                    .iter()
                    .map(|&(id, certainty)| SymbolChoice {
                        text: self.text(id),
                        certainty,
                        confidence: self.calibration.confidence(certainty),
                    })
                    .collect();
            }
            if let Some(steps) = timesteps.and_then(|t| t.get(index)) {
                symbol.timesteps = steps
                    .iter()
                    .map(|step| TimestepChoices {
                        timestep: step.timestep,
                        choices: step.choices.iter().map(|&(id, p)| (self.text(id), p)).collect(),
                    })
                    .collect();
            }
            symbols.push(symbol);
        }

        let text: String = symbols.iter().map(|s| s.text.as_str()).collect();
        let certainty = chars.iter().map(|(_, c)| c.certainty).fold(0.0f32, f32::min);
        let rating = chars.iter().map(|(_, c)| c.rating).sum();
        let bbox = symbols
            .iter()
            .fold(BoundingBox::default(), |acc, s| acc.union(&s.bbox));
        let in_dictionary = self.dictionary.is_some() && chars.iter().all(|(_, c)| c.in_dictionary);
        let accepted = self.dictionary.is_some_and(|d| d.accept_word(&text, certainty));

        WordResult {
            text,
            bbox,
            certainty,
            rating,
            confidence: self.calibration.confidence(certainty),
            symbols,
            in_dictionary,
            accepted,
            fake: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::WordListDictionary;
    use crate::recognizer::calibration::LinearCalibration;

    fn ch(unichar_id: usize, start: usize, end: usize) -> DecodedChar {
        DecodedChar {
            unichar_id,
            start,
            end,
            certainty: -0.5,
            rating: 0.5,
            in_dictionary: true,
        }
    }

    #[test]
    fn test_splits_on_spaces_and_maps_boxes() {
        // ' '=0 h=1 i=2 o=3
        let unicharset = Unicharset::from_text("hio");
        let calibration = LinearCalibration::default();
        let dict = WordListDictionary::from_words(["hi"]);
        let builder = WordBuilder {
            unicharset: &unicharset,
            calibration: &calibration,
            dictionary: Some(&dict),
            line_box: BoundingBox::new(100, 10, 300, 42),
            x_scale: 4,
            scale: 0.5,
            scaled_width: 100,
        };
        let path = DecodedPath {
            chars: vec![ch(1, 0, 2), ch(2, 3, 5), ch(0, 6, 7), ch(3, 8, 10)],
            score: -2.0,
        };
        let words = builder.build(&path, None, None);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "hi");
        assert!(words[0].accepted);
        assert!(!words[1].accepted);
        // Timestep 3 → scaled pixel 12 → original pixel 24.
        assert_eq!(words[0].symbols[1].bbox.left, 124);
        assert_eq!(words[0].bbox, BoundingBox::new(100, 10, 140, 42));
        assert_eq!(words[1].bbox.right, 180);
        assert_eq!(words[0].confidence, 97.5);
    }

    #[test]
    fn test_boxes_clip_to_line() {
        let unicharset = Unicharset::from_text("a");
        let calibration = LinearCalibration::default();
        let builder = WordBuilder {
            unicharset: &unicharset,
            calibration: &calibration,
            dictionary: None,
            line_box: BoundingBox::new(0, 0, 20, 10),
            x_scale: 4,
            scale: 1.0,
            scaled_width: 18,
        };
        let path = DecodedPath {
            chars: vec![ch(1, 3, 5)],
            score: 0.0,
        };
        let choices = vec![vec![(1, -0.5), (0, -3.0)]];
        let words = builder.build(&path, Some(choices.as_slice()), None);
        assert_eq!(words[0].bbox.right, 18);
        assert_eq!(words[0].symbols[0].choices.len(), 2);
        assert!(!words[0].in_dictionary);
    }
}
