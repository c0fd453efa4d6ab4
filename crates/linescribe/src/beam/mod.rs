//! Turning per-timestep label probabilities into character sequences.
//!
//! [`RecodeBeamSearch`] is the full decoder: a bounded beam over recoder
//! label sequences with CTC null/duplicate handling and optional dictionary
//! guidance. [`decode_greedy`] is the best-label-per-timestep shortcut used for
//! models trained without alignment.

pub mod dictionary;
pub mod search;

pub use dictionary::{DictState, Dictionary, WordListDictionary};
pub use search::{Exclusion, RecodeBeamSearch};

use crate::network::NetworkIO;
use crate::recoder::{RecodedCharId, Recoder};
use serde::{Deserialize, Serialize};

/// Certainties (log probabilities) are clipped at this floor.
pub const MIN_CERTAINTY: f32 = -20.0;

/// Log probability of `p`, clipped to [`MIN_CERTAINTY`].
#[inline]
pub fn certainty(p: f32) -> f32 {
    if p > 0.0 { p.ln().max(MIN_CERTAINTY) } else { MIN_CERTAINTY }
}

/// Beam search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamConfig {
    /// Live hypotheses kept after each timestep.
    pub beam_width: usize,
    /// Highest-probability labels considered at each timestep (null and the
    /// hypothesis's own previous label are always considered too).
    pub top_n: usize,
    /// Factor applied to certainties of labels outside any dictionary word.
    pub dict_ratio: f32,
    /// Added to certainties of labels inside a dictionary word.
    pub cert_offset: f32,
    /// Distinct complete paths reported besides the best one.
    pub max_paths: usize,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            beam_width: 16,
            top_n: 6,
            dict_ratio: 2.25,
            cert_offset: -0.085,
            max_paths: 5,
        }
    }
}

/// One recognized character and where it sits on the timestep axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedChar {
    pub unichar_id: usize,
    /// First timestep of the character's first label.
    pub start: usize,
    /// One past the last timestep that carried one of its labels.
    pub end: usize,
    /// Lowest label certainty within the character.
    pub certainty: f32,
    /// Sum of negated label certainties.
    pub rating: f32,
    /// Whether the character was part of a dictionary word on this path.
    pub in_dictionary: bool,
}

/// A complete decoding of a line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodedPath {
    pub chars: Vec<DecodedChar>,
    pub score: f64,
}

impl DecodedPath {
    pub fn unichar_ids(&self) -> Vec<usize> {
        self.chars.iter().map(|c| c.unichar_id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Mean certainty per character, 0 for an empty path.
    pub fn mean_certainty(&self) -> f32 {
        if self.chars.is_empty() {
            return 0.0;
        }
        self.chars.iter().map(|c| c.certainty).sum::<f32>() / self.chars.len() as f32
    }
}

/// Everything one decode call produces.
#[derive(Debug, Clone, Default)]
pub struct BeamResult {
    pub best: DecodedPath,
    /// Further complete paths with distinct text, best first.
    pub alternatives: Vec<DecodedPath>,
    /// Live hypotheses after each timestep.
    pub beam_sizes: Vec<usize>,
}

/// Top labels at one timestep, as (unichar id, probability).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestepChoice {
    pub timestep: usize,
    pub choices: Vec<(usize, f32)>,
}

/// Best label at each timestep, collapsing repeats and nulls.
///
/// Multi-label codes are assembled as they arrive; a label that cannot
/// extend the current partial code starts a new one.
pub fn decode_greedy(outputs: &NetworkIO, recoder: &Recoder) -> DecodedPath {
    let outputs = outputs.to_float();
    let width = outputs.stride_map().width(0);
    let null = recoder.null_label();
    let mut path = DecodedPath::default();
    let mut code = RecodedCharId::new();
    let mut code_start = 0;
    let mut code_cert = 0.0f32;
    let mut code_rating = 0.0f32;
    let mut prev_label = null;

    for t in 0..width {
        let (label, p) = outputs.best_label(t);
        let cert = certainty(p);
        path.score += f64::from(cert);
        if label == null {
            prev_label = null;
            continue;
        }
        if label == prev_label {
            if code.is_empty()
                && let Some(last) = path.chars.last_mut()
            {
                last.end = t + 1;
            }
            continue;
        }
        prev_label = label;

        let label32 = label as u32;
        let extends = !code.is_empty()
            && (recoder.next_codes(&code).contains(&label32) || recoder.final_codes(&code).contains(&label32));
        if !extends {
            code = RecodedCharId::new();
            if !recoder.is_valid_first_code(label) {
                continue;
            }
            code_start = t;
            code_cert = 0.0;
            code_rating = 0.0;
        }
        code.push(label32);
        code_cert = code_cert.min(cert);
        code_rating -= cert;
        if let Some(unichar_id) = recoder.decode_unichar(&code) {
            path.chars.push(DecodedChar {
                unichar_id,
                start: code_start,
                end: t + 1,
                certainty: code_cert,
                rating: code_rating,
                in_dictionary: false,
            });
            code = RecodedCharId::new();
        }
    }
    path
}
