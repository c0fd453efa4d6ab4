//! Mapping between character ids and the labels a network emits.
//!
//! A small character set is predicted directly: label `k` is character `k`
//! (pass-through mode). A large one (CJK scripts, for instance) would need a
//! very wide output layer, so each character is instead spelled as a short
//! sequence of labels drawn from a much smaller alphabet (compressed mode).
//!
//! Labels `0..code_range()` spell characters. One more label,
//! [`Recoder::null_label`], means "no output at this timestep", so a
//! network's output layer has [`Recoder::num_labels`] entries.
//!
//! The mode and maximum code length are fixed when the recoder is built and
//! cannot change for the lifetime of a loaded model.

mod compress;
pub mod unicharset;

pub use unicharset::{SPACE, SPACE_ID, Unicharset};

use crate::{LinescribeError, Result};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest label sequence any character may use.
pub const MAX_CODE_LEN: usize = 9;

/// A label sequence spelling one character (or a prefix of one).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RecodedCharId {
    len: u8,
    labels: [u32; MAX_CODE_LEN],
}

impl RecodedCharId {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// Panics if `labels` is longer than [`MAX_CODE_LEN`].
    pub fn from_labels(labels: &[u32]) -> Self {
        let mut code = Self::new();
        for &label in labels {
            code.push(label);
        }
        code
    }

    /// # Panics
    ///
    /// Panics when the code is already [`MAX_CODE_LEN`] labels long.
    pub fn push(&mut self, label: u32) {
        let len = usize::from(self.len);
        assert!(len < MAX_CODE_LEN, "recoded character exceeds {MAX_CODE_LEN} labels");
        self.labels[len] = label;
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.labels[..self.len()]
    }

    /// The first `n` labels.
    pub fn prefix(&self, n: usize) -> Self {
        Self::from_labels(&self.as_slice()[..n.min(self.len())])
    }
}

impl fmt::Debug for RecodedCharId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RecoderMode {
    PassThrough,
    Compressed { direct: usize, radix: usize },
}

/// Serialized form: the mode and the code of every character.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecoderTable {
    mode: RecoderMode,
    codes: Vec<Vec<u32>>,
}

#[derive(Debug, Clone)]
struct Continuations {
    /// Labels that complete a character after this prefix.
    finals: Vec<u32>,
    /// Labels that extend this prefix without completing a character.
    nexts: Vec<u32>,
}

/// Bidirectional character id ↔ label sequence table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RecoderTable", into = "RecoderTable")]
pub struct Recoder {
    mode: RecoderMode,
    encoder: Vec<RecodedCharId>,
    decoder: AHashMap<RecodedCharId, usize>,
    continuations: AHashMap<RecodedCharId, Continuations>,
    first_valid: Vec<bool>,
    code_range: usize,
    max_code_len: usize,
}

impl TryFrom<RecoderTable> for Recoder {
    type Error = LinescribeError;

    fn try_from(table: RecoderTable) -> Result<Self> {
        let mut codes = Vec::with_capacity(table.codes.len());
        for (id, labels) in table.codes.iter().enumerate() {
            if labels.is_empty() || labels.len() > MAX_CODE_LEN {
                return Err(LinescribeError::model(format!(
                    "recoder code for character {id} has {} labels",
                    labels.len()
                )));
            }
            codes.push(RecodedCharId::from_labels(labels));
        }
        Self::from_codes(table.mode, codes)
    }
}

impl From<Recoder> for RecoderTable {
    fn from(recoder: Recoder) -> Self {
        RecoderTable {
            mode: recoder.mode,
            codes: recoder.encoder.iter().map(|c| c.as_slice().to_vec()).collect(),
        }
    }
}

impl Recoder {
    /// One label per character.
    pub fn pass_through(size: usize) -> Self {
        let codes = (0..size).map(|id| RecodedCharId::from_labels(&[id as u32])).collect();
        Self::build(RecoderMode::PassThrough, codes)
    }

    /// Multi-label codes: the first `direct` ids are single labels, the rest
    /// are spelled in base `radix`.
    pub fn compressed(size: usize, direct: usize, radix: usize) -> Result<Self> {
        let codes = compress::assign_codes(size, direct, radix)?;
        let recoder = Self::from_codes(RecoderMode::Compressed { direct, radix }, codes)?;
        debug_assert_eq!(recoder.code_range, compress::code_range(size, direct, radix));
        Ok(recoder)
    }

    /// Pass-through for small sets, compressed with a square-root radix otherwise.
    pub fn for_charset_size(size: usize, pass_through_limit: usize) -> Result<Self> {
        if size <= pass_through_limit {
            return Ok(Self::pass_through(size));
        }
        let direct = pass_through_limit.clamp(1, size);
        let rest = size - direct;
        let radix = ((rest as f64).sqrt().ceil() as usize).max(2);
        Self::compressed(size, direct, radix)
    }

    fn from_codes(mode: RecoderMode, encoder: Vec<RecodedCharId>) -> Result<Self> {
        let recoder = Self::build(mode, encoder);
        recoder.check_tables()?;
        Ok(recoder)
    }

    fn build(mode: RecoderMode, encoder: Vec<RecodedCharId>) -> Self {
        let mut decoder = AHashMap::with_capacity(encoder.len());
        let mut code_range = 0usize;
        let mut max_code_len = 0usize;
        for (id, code) in encoder.iter().enumerate() {
            decoder.entry(*code).or_insert(id);
            max_code_len = max_code_len.max(code.len());
            if let Some(&top) = code.as_slice().iter().max() {
                code_range = code_range.max(top as usize + 1);
            }
        }

        let mut continuations: AHashMap<RecodedCharId, Continuations> = AHashMap::new();
        let mut first_valid = vec![false; code_range];
        for code in encoder.iter().filter(|c| !c.is_empty()) {
            first_valid[code.as_slice()[0] as usize] = true;
            for n in 0..code.len() {
                let label = code.as_slice()[n];
                let entry = continuations.entry(code.prefix(n)).or_insert_with(|| Continuations {
                    finals: Vec::new(),
                    nexts: Vec::new(),
                });
                let list = if n + 1 == code.len() { &mut entry.finals } else { &mut entry.nexts };
                if !list.contains(&label) {
                    list.push(label);
                }
            }
        }
        for entry in continuations.values_mut() {
            entry.finals.sort_unstable();
            entry.nexts.sort_unstable();
        }

        Self {
            mode,
            encoder,
            decoder,
            continuations,
            first_valid,
            code_range,
            max_code_len,
        }
    }

    /// Every code must be unique and no complete code may prefix another.
    fn check_tables(&self) -> Result<()> {
        for (id, code) in self.encoder.iter().enumerate() {
            let owner = self.decoder.get(code).copied().unwrap_or(id);
            if owner != id {
                return Err(LinescribeError::model(format!(
                    "characters {owner} and {id} share the code {code:?}"
                )));
            }
        }
        for (prefix, entry) in &self.continuations {
            if entry.finals.iter().any(|l| entry.nexts.contains(l)) {
                return Err(LinescribeError::model(format!(
                    "recoder codes are ambiguous after prefix {prefix:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn mode(&self) -> RecoderMode {
        self.mode
    }

    pub fn is_pass_through(&self) -> bool {
        self.mode == RecoderMode::PassThrough
    }

    /// Number of characters the table covers.
    pub fn size(&self) -> usize {
        self.encoder.len()
    }

    /// Labels used by character codes.
    pub fn code_range(&self) -> usize {
        self.code_range
    }

    /// The "no output" label, just past the code range.
    pub fn null_label(&self) -> usize {
        self.code_range
    }

    /// Output width a network needs to drive this recoder.
    pub fn num_labels(&self) -> usize {
        self.code_range + 1
    }

    pub fn max_code_len(&self) -> usize {
        self.max_code_len
    }

    pub fn encode_unichar(&self, id: usize) -> Option<RecodedCharId> {
        self.encoder.get(id).copied()
    }

    /// Character spelled by `code`, or `None` if it is not a complete code.
    pub fn decode_unichar(&self, code: &RecodedCharId) -> Option<usize> {
        if code.len() > self.max_code_len {
            return None;
        }
        self.decoder.get(code).copied()
    }

    pub fn is_valid_first_code(&self, label: usize) -> bool {
        self.first_valid.get(label).copied().unwrap_or(false)
    }

    /// Labels that continue `prefix` without completing a character.
    pub fn next_codes(&self, prefix: &RecodedCharId) -> &[u32] {
        self.continuations.get(prefix).map_or(&[], |c| c.nexts.as_slice())
    }

    /// Labels that complete a character after `prefix`.
    pub fn final_codes(&self, prefix: &RecodedCharId) -> &[u32] {
        self.continuations.get(prefix).map_or(&[], |c| c.finals.as_slice())
    }

    /// Flatten character ids into the label sequence a network is trained on.
    pub fn encode_ids(&self, ids: &[usize]) -> Result<Vec<u32>> {
        let mut labels = Vec::with_capacity(ids.len());
        for &id in ids {
            let code = self.encode_unichar(id).ok_or_else(|| {
                LinescribeError::validation(format!("character id {id} has no recoder code"))
            })?;
            labels.extend_from_slice(code.as_slice());
        }
        Ok(labels)
    }

    /// The space must be a single label that decodes back to itself.
    pub fn check_space(&self) -> Result<()> {
        let Some(code) = self.encode_unichar(SPACE_ID) else {
            return Err(LinescribeError::model("recoder has no code for the space character"));
        };
        if code.len() != 1 || self.decode_unichar(&code) != Some(SPACE_ID) {
            return Err(LinescribeError::model(format!(
                "space character does not round-trip through the recoder (code {code:?})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_through_labels() {
        let recoder = Recoder::pass_through(5);
        assert!(recoder.is_pass_through());
        assert_eq!(recoder.code_range(), 5);
        assert_eq!(recoder.null_label(), 5);
        assert_eq!(recoder.num_labels(), 6);
        assert_eq!(recoder.encode_unichar(3).unwrap().as_slice(), &[3]);
        assert!(recoder.is_valid_first_code(4));
        assert!(!recoder.is_valid_first_code(5));
        assert!(recoder.check_space().is_ok());
    }

    #[test]
    fn test_compressed_roundtrip_every_character() {
        let recoder = Recoder::compressed(200, 20, 14).unwrap();
        assert_eq!(recoder.max_code_len(), 2);
        for id in 0..200 {
            let code = recoder.encode_unichar(id).unwrap();
            assert_eq!(recoder.decode_unichar(&code), Some(id));
        }
        assert!(recoder.code_range() < 200);
    }

    #[test]
    fn test_continuations() {
        let recoder = Recoder::compressed(10, 4, 3).unwrap();
        let empty = RecodedCharId::new();
        assert_eq!(recoder.final_codes(&empty), &[0, 1, 2, 3]);
        assert_eq!(recoder.next_codes(&empty), &[4, 5]);
        let prefix = RecodedCharId::from_labels(&[5]);
        assert_eq!(recoder.final_codes(&prefix), &[7, 8, 9]);
        assert!(recoder.next_codes(&prefix).is_empty());
        assert_eq!(recoder.decode_unichar(&prefix), None);
    }

    #[test]
    fn test_serde_rejects_duplicate_codes() {
        let json = r#"{"mode":{"kind":"pass_through"},"codes":[[0],[1],[1]]}"#;
        assert!(serde_json::from_str::<Recoder>(json).is_err());
    }

    #[test]
    fn test_space_must_be_single_label() {
        let table = RecoderTable {
            mode: RecoderMode::Compressed { direct: 1, radix: 2 },
            codes: vec![vec![1, 3], vec![0]],
        };
        let recoder = Recoder::try_from(table).unwrap();
        assert!(matches!(recoder.check_space(), Err(LinescribeError::Model { .. })));
    }

    #[test]
    fn test_for_charset_size_switches_mode() {
        assert!(Recoder::for_charset_size(50, 100).unwrap().is_pass_through());
        let big = Recoder::for_charset_size(5000, 100).unwrap();
        assert!(!big.is_pass_through());
        assert!(big.num_labels() < 500);
    }

    #[test]
    fn test_compressed_with_few_multi_label_characters() {
        let recoder = Recoder::compressed(5, 4, 3).unwrap();
        assert_eq!(recoder.code_range(), 5);
        assert_eq!(recoder.decode_unichar(&recoder.encode_unichar(4).unwrap()), Some(4));

        let just_over = Recoder::for_charset_size(257, 256).unwrap();
        assert!(!just_over.is_pass_through());
        assert_eq!(just_over.code_range(), 257);
        assert_eq!(just_over.num_labels(), 258);
        for id in 0..257 {
            let code = just_over.encode_unichar(id).unwrap();
            assert_eq!(just_over.decode_unichar(&code), Some(id));
        }
    }
}
