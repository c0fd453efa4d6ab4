//! Beam search over recoder label sequences.
//!
//! Hypotheses live in an arena of [`RecodeNode`]s, one node per hypothesis
//! per timestep, each pointing at its predecessor by index. A timestep extends
//! every live hypothesis with the labels the recoder allows next, merges
//! hypotheses that can no longer be told apart, and keeps the best
//! `beam_width`. The best surviving leaf is traced back to timestep zero to
//! recover the characters and their timestep ranges. The arena is dropped
//! with the search state at the end of the call.
//!
//! # Scoring
//!
//! Every label adds its certainty `ln p` (clipped at [`MIN_CERTAINTY`]) to the
//! path score. With a dictionary, labels of a word that is still a valid
//! dictionary prefix add `cert + cert_offset` instead, and labels of any other
//! word add `cert · dict_ratio`. When a word leaves the dictionary, ends
//! without being a complete entry, or its certainty drops below the
//! dictionary's worst acceptable certainty, its labels are rescored at the
//! non-dictionary rate. Nulls and CTC duplicates add their plain certainty.

use super::dictionary::{DictState, Dictionary};
use super::{BeamConfig, BeamResult, DecodedChar, DecodedPath, MIN_CERTAINTY, TimestepChoice, certainty};
use crate::network::NetworkIO;
use crate::recoder::{RecodedCharId, Recoder, SPACE_ID, Unicharset};
use ahash::AHashMap;
use std::cmp::Ordering;

/// Forbids decoding `unichar_id` as a character that starts within `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exclusion {
    pub unichar_id: usize,
    pub start: usize,
    pub end: usize,
}

const ROOT: u32 = u32::MAX;

#[derive(Debug, Clone)]
struct RecodeNode {
    prev: u32,
    /// `None` only for the virtual root before timestep zero.
    label: Option<u32>,
    /// CTC repeat of the previous label.
    duplicate: bool,
    /// Character completed by this node's label.
    unichar_id: Option<usize>,
    /// Timestep at which the character being assembled (or just completed) started.
    char_start: usize,
    certainty: f32,
    score: f64,
    /// Partial code of the character in progress.
    code: RecodedCharId,
    /// Dictionary state of the current word; `None` once it left the dictionary.
    dict_state: Option<DictState>,
    /// Plain certainty sum of the current word's labels.
    word_raw: f64,
    /// Score contributed by the current word's labels.
    word_contrib: f64,
    word_min_cert: f32,
    /// Rolling hash of every character emitted so far.
    char_hash: u64,
    num_chars: u32,
    char_cert_sum: f32,
}

impl RecodeNode {
    fn mean_char_certainty(&self) -> f32 {
        if self.num_chars == 0 {
            0.0
        } else {
            self.char_cert_sum / self.num_chars as f32
        }
    }
}

/// Hypotheses that agree on all of these have identical futures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MergeKey {
    char_hash: u64,
    code: RecodedCharId,
    label: Option<u32>,
    dict_state: Option<DictState>,
}

/// Higher score first, then better mean character certainty, then dictionary words.
fn compare(a: &RecodeNode, b: &RecodeNode) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.mean_char_certainty()
                .partial_cmp(&a.mean_char_certainty())
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| b.dict_state.is_some().cmp(&a.dict_state.is_some()))
}

fn mix_hash(hash: u64, unichar_id: usize) -> u64 {
    (hash ^ (unichar_id as u64 + 1)).wrapping_mul(0x0100_0000_01b3).rotate_left(7)
}

/// Decoder bound to one model's recoder and character set.
pub struct RecodeBeamSearch<'a> {
    recoder: &'a Recoder,
    unicharset: &'a Unicharset,
    dictionary: Option<&'a dyn Dictionary>,
    config: BeamConfig,
}

impl std::fmt::Debug for RecodeBeamSearch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecodeBeamSearch")
            .field("code_range", &self.recoder.code_range())
            .field("has_dictionary", &self.dictionary.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl<'a> RecodeBeamSearch<'a> {
    pub fn new(recoder: &'a Recoder, unicharset: &'a Unicharset, config: BeamConfig) -> Self {
        Self {
            recoder,
            unicharset,
            dictionary: None,
            config,
        }
    }

    pub fn with_dictionary(mut self, dictionary: &'a dyn Dictionary) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    pub fn config(&self) -> &BeamConfig {
        &self.config
    }

    /// Decode a line of softmax outputs (only the first line of a batch is used).
    pub fn decode(&self, outputs: &NetworkIO) -> BeamResult {
        self.decode_excluding(outputs, &[])
    }

    /// Decode while forbidding the given characters at the given positions.
    pub fn decode_excluding(&self, outputs: &NetworkIO, exclusions: &[Exclusion]) -> BeamResult {
        let outputs = outputs.to_float();
        let width = outputs.stride_map().width(0);
        assert_eq!(
            outputs.depth(),
            self.recoder.num_labels(),
            "network produces {} labels but the recoder needs {}",
            outputs.depth(),
            self.recoder.num_labels()
        );

        let mut search = Search {
            owner: self,
            arena: Vec::with_capacity(width * self.config.beam_width.max(1)),
            exclusions,
        };
        let mut beam = vec![ROOT];
        let mut beam_sizes = Vec::with_capacity(width);
        let mut top = Vec::with_capacity(self.config.top_n + 2);

        for t in 0..width {
            let probs = outputs.f(t);
            self.top_labels(probs, &mut top);
            beam = search.step(t, probs, &beam, &top);
            beam_sizes.push(beam.len());
            tracing::trace!(timestep = t, live = beam.len(), "beam step");
        }

        let finals = search.finish(&beam);
        let mut paths: Vec<DecodedPath> = Vec::new();
        let mut seen = Vec::new();
        for node in finals {
            let path = search.extract(node, width);
            let ids = path.unichar_ids();
            if seen.contains(&ids) {
                continue;
            }
            seen.push(ids);
            paths.push(path);
            if paths.len() > self.config.max_paths {
                break;
            }
        }
        let mut paths = paths.into_iter();
        let best = paths.next().unwrap_or_default();
        BeamResult {
            best,
            alternatives: paths.collect(),
            beam_sizes,
        }
    }

    /// Alternative characters for each character of `best`, best first.
    ///
    /// Each iteration re-decodes with every character found so far excluded
    /// at its position and collects what the decoder picks instead.
    pub fn alternatives(&self, outputs: &NetworkIO, best: &DecodedPath, iterations: usize) -> Vec<Vec<(usize, f32)>> {
        let mut choices: Vec<Vec<(usize, f32)>> = best
            .chars
            .iter()
            .map(|c| vec![(c.unichar_id, c.certainty)])
            .collect();
        let mut exclusions: Vec<Exclusion> = best
            .chars
            .iter()
            .map(|c| Exclusion {
                unichar_id: c.unichar_id,
                start: c.start,
                end: c.end,
            })
            .collect();

        for _ in 0..iterations {
            let result = self.decode_excluding(outputs, &exclusions);
            let mut found = false;
            for ch in &result.best.chars {
                let Some(slot) = best.chars.iter().position(|b| ch.start < b.end && b.start < ch.end) else {
                    continue;
                };
                if !choices[slot].iter().any(|&(id, _)| id == ch.unichar_id) {
                    choices[slot].push((ch.unichar_id, ch.certainty));
                    found = true;
                }
                exclusions.push(Exclusion {
                    unichar_id: ch.unichar_id,
                    start: ch.start,
                    end: ch.end,
                });
            }
            if !found {
                break;
            }
        }
        choices
    }

    /// Most probable single-label characters at every timestep of each character.
    pub fn timestep_choices(&self, outputs: &NetworkIO, path: &DecodedPath, top: usize) -> Vec<Vec<TimestepChoice>> {
        let outputs = outputs.to_float();
        let mut labels = Vec::new();
        path.chars
            .iter()
            .map(|ch| {
                (ch.start..ch.end.min(outputs.width()))
                    .map(|t| {
                        let probs = outputs.f(t);
                        self.top_labels_n(probs, top, &mut labels);
                        let choices = labels
                            .iter()
                            .filter_map(|&label| {
                                let code = RecodedCharId::from_labels(&[label as u32]);
                                self.recoder.decode_unichar(&code).map(|id| (id, probs[label]))
                            })
                            .collect();
                        TimestepChoice { timestep: t, choices }
                    })
                    .collect()
            })
            .collect()
    }

    fn top_labels(&self, probs: &[f32], out: &mut Vec<usize>) {
        self.top_labels_n(probs, self.config.top_n, out);
    }

    fn top_labels_n(&self, probs: &[f32], n: usize, out: &mut Vec<usize>) {
        out.clear();
        out.extend(0..probs.len());
        let n = n.min(probs.len());
        if n == 0 {
            out.clear();
            return;
        }
        out.select_nth_unstable_by(n - 1, |&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));
        out.truncate(n);
        out.sort_unstable_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal).then(a.cmp(&b)));
    }
}

struct Search<'s, 'a> {
    owner: &'s RecodeBeamSearch<'a>,
    arena: Vec<RecodeNode>,
    exclusions: &'s [Exclusion],
}

impl Search<'_, '_> {
    fn root(&self) -> RecodeNode {
        RecodeNode {
            prev: ROOT,
            label: None,
            duplicate: false,
            unichar_id: None,
            char_start: 0,
            certainty: 0.0,
            score: 0.0,
            code: RecodedCharId::new(),
            dict_state: self.owner.dictionary.map(|d| d.start()),
            word_raw: 0.0,
            word_contrib: 0.0,
            word_min_cert: 0.0,
            char_hash: 0,
            num_chars: 0,
            char_cert_sum: 0.0,
        }
    }

    fn node(&self, index: u32) -> RecodeNode {
        if index == ROOT {
            self.root()
        } else {
            self.arena[index as usize].clone()
        }
    }

    fn is_excluded(&self, unichar_id: usize, start: usize) -> bool {
        self.exclusions
            .iter()
            .any(|e| e.unichar_id == unichar_id && start >= e.start && start < e.end)
    }

    /// Withdraw dictionary scoring from the current word.
    fn leave_dictionary(&self, node: &mut RecodeNode) {
        if node.dict_state.is_none() {
            return;
        }
        let rescored = node.word_raw * f64::from(self.owner.config.dict_ratio);
        node.score += rescored - node.word_contrib;
        node.word_contrib = rescored;
        node.dict_state = None;
    }

    /// Close the current word at a space or at the end of the line.
    fn end_word(&self, node: &mut RecodeNode) {
        if let (Some(dict), Some(state)) = (self.owner.dictionary, node.dict_state)
            && !dict.is_word_end(state)
            && node.word_raw != 0.0
        {
            self.leave_dictionary(node);
        }
        node.dict_state = self.owner.dictionary.map(|d| d.start());
        node.word_raw = 0.0;
        node.word_contrib = 0.0;
        node.word_min_cert = 0.0;
    }

    /// Score a code label of the current word.
    fn add_word_label(&self, node: &mut RecodeNode, cert: f32) {
        let cert64 = f64::from(cert);
        let contribution = match (self.owner.dictionary, node.dict_state) {
            (None, _) => cert64,
            (Some(_), Some(_)) => cert64 + f64::from(self.owner.config.cert_offset),
            (Some(_), None) => cert64 * f64::from(self.owner.config.dict_ratio),
        };
        node.score += contribution;
        node.word_raw += cert64;
        node.word_contrib += contribution;
        node.word_min_cert = node.word_min_cert.min(cert);
    }

    fn extend(&self, parent_index: u32, parent: &RecodeNode, t: usize, label: usize, probs: &[f32]) -> Option<RecodeNode> {
        let recoder = self.owner.recoder;
        let null = recoder.null_label();
        let cert = certainty(probs[label]);
        let label32 = label as u32;
        let mut node = parent.clone();
        node.prev = parent_index;
        node.label = Some(label32);
        node.unichar_id = None;
        node.duplicate = false;
        node.certainty = cert;

        if label == null {
            node.score += f64::from(cert);
            return Some(node);
        }
        if parent.label == Some(label32) {
            node.duplicate = true;
            node.score += f64::from(cert);
            return Some(node);
        }

        let is_final = recoder.final_codes(&parent.code).contains(&label32);
        let is_next = recoder.next_codes(&parent.code).contains(&label32);
        if !is_final && !is_next {
            return None;
        }
        if parent.code.is_empty() {
            node.char_start = t;
        }
        node.code.push(label32);

        if !is_final {
            self.add_word_label(&mut node, cert);
            return Some(node);
        }

        let unichar_id = recoder.decode_unichar(&node.code)?;
        if self.is_excluded(unichar_id, node.char_start) {
            return None;
        }
        node.code = RecodedCharId::new();
        node.unichar_id = Some(unichar_id);
        node.char_hash = mix_hash(node.char_hash, unichar_id);
        node.num_chars += 1;

        if unichar_id == SPACE_ID {
            self.end_word(&mut node);
            node.score += f64::from(cert);
            node.char_cert_sum += cert;
            return Some(node);
        }

        self.add_word_label(&mut node, cert);
        node.char_cert_sum += self.char_certainty(&node, cert);
        if let (Some(dict), Some(state)) = (self.owner.dictionary, node.dict_state) {
            let text = self.owner.unicharset.get(unichar_id).unwrap_or_default();
            match dict.advance(state, text) {
                Some(next) if node.word_min_cert >= dict.worst_certainty() => node.dict_state = Some(next),
                _ => self.leave_dictionary(&mut node),
            }
        }
        Some(node)
    }

    /// Certainty of the character just completed: the minimum over its labels.
    fn char_certainty(&self, node: &RecodeNode, last_cert: f32) -> f32 {
        let null = Some(self.owner.recoder.null_label() as u32);
        let mut cert = last_cert;
        let mut index = node.prev;
        while index != ROOT {
            let prev = &self.arena[index as usize];
            if prev.code.is_empty() {
                break;
            }
            if !prev.duplicate && prev.label != null {
                cert = cert.min(prev.certainty);
            }
            index = prev.prev;
        }
        cert
    }

    fn step(&mut self, t: usize, probs: &[f32], beam: &[u32], top: &[usize]) -> Vec<u32> {
        let null = self.owner.recoder.null_label();
        let mut candidates: Vec<RecodeNode> = Vec::with_capacity(beam.len() * (top.len() + 2));
        let mut merged: AHashMap<MergeKey, usize> = AHashMap::with_capacity(candidates.capacity());
        let mut labels: Vec<usize> = Vec::with_capacity(top.len() + 2);

        for &index in beam {
            let parent = self.node(index);
            labels.clear();
            labels.extend_from_slice(top);
            if !labels.contains(&null) {
                labels.push(null);
            }
            if let Some(prev) = parent.label
                && !labels.contains(&(prev as usize))
            {
                labels.push(prev as usize);
            }
            for &label in &labels {
                let Some(node) = self.extend(index, &parent, t, label, probs) else {
                    continue;
                };
                let key = MergeKey {
                    char_hash: node.char_hash,
                    code: node.code,
                    label: if node.label == Some(null as u32) { None } else { node.label },
                    dict_state: node.dict_state,
                };
                match merged.get(&key) {
                    Some(&slot) => {
                        if compare(&node, &candidates[slot]) == Ordering::Less {
                            candidates[slot] = node;
                        }
                    }
                    None => {
                        merged.insert(key, candidates.len());
                        candidates.push(node);
                    }
                }
            }
        }

        candidates.sort_by(compare);
        candidates.truncate(self.owner.config.beam_width.max(1));
        let mut next = Vec::with_capacity(candidates.len());
        for node in candidates {
            next.push(self.arena.len() as u32);
            self.arena.push(node);
        }
        next
    }

    /// Close the last word on every surviving hypothesis and rank them.
    ///
    /// Hypotheses stuck in the middle of a multi-label code lose that code.
    fn finish(&mut self, beam: &[u32]) -> Vec<u32> {
        let mut finals: Vec<u32> = Vec::with_capacity(beam.len());
        for &index in beam {
            if index == ROOT {
                continue;
            }
            let mut node = self.arena[index as usize].clone();
            self.end_word(&mut node);
            self.arena[index as usize].score = node.score;
            self.arena[index as usize].dict_state = node.dict_state;
            finals.push(index);
        }
        finals.sort_by(|&a, &b| {
            let (na, nb) = (&self.arena[a as usize], &self.arena[b as usize]);
            let complete = na.code.is_empty().cmp(&nb.code.is_empty()).reverse();
            complete.then_with(|| compare(na, nb))
        });
        finals
    }

    /// Walk back from `leaf` and rebuild the characters in reading order.
    fn extract(&self, leaf: u32, width: usize) -> DecodedPath {
        let null = self.owner.recoder.null_label() as u32;
        let mut chain = Vec::with_capacity(width);
        let mut index = leaf;
        while index != ROOT {
            chain.push(index);
            index = self.arena[index as usize].prev;
        }
        chain.reverse();

        let mut path = DecodedPath {
            chars: Vec::new(),
            score: self.arena.get(leaf as usize).map_or(0.0, |n| n.score),
        };
        let mut label_certs: Vec<f32> = Vec::new();
        for (t, &index) in chain.iter().enumerate() {
            let node = &self.arena[index as usize];
            if node.label == Some(null) {
                continue;
            }
            if node.duplicate {
                // Repeats after a finished character stretch it; repeats inside a code do not.
                if node.code.is_empty()
                    && let Some(last) = path.chars.last_mut()
                {
                    last.end = t + 1;
                }
                continue;
            }
            label_certs.push(node.certainty);
            if let Some(unichar_id) = node.unichar_id {
                let certainty = label_certs.iter().copied().fold(0.0f32, f32::min).max(MIN_CERTAINTY);
                let rating = -label_certs.iter().sum::<f32>();
                path.chars.push(DecodedChar {
                    unichar_id,
                    start: node.char_start,
                    end: t + 1,
                    certainty,
                    rating,
                    in_dictionary: self.owner.dictionary.is_some() && node.dict_state.is_some(),
                });
                label_certs.clear();
            }
        }
        mark_dictionary_words(&mut path, self.owner.unicharset, self.owner.dictionary);
        path
    }
}

/// Flag characters of whole words the dictionary contains.
fn mark_dictionary_words(path: &mut DecodedPath, unicharset: &Unicharset, dictionary: Option<&dyn Dictionary>) {
    let Some(dict) = dictionary else {
        for ch in &mut path.chars {
            ch.in_dictionary = false;
        }
        return;
    };
    let mut start = 0;
    while start < path.chars.len() {
        let end = path.chars[start..]
            .iter()
            .position(|c| c.unichar_id == SPACE_ID)
            .map_or(path.chars.len(), |p| start + p);
        let mut state = Some(dict.start());
        for ch in &path.chars[start..end] {
            let text = unicharset.get(ch.unichar_id).unwrap_or_default();
            state = state.and_then(|s| dict.advance(s, text));
        }
        let valid = end > start && state.is_some_and(|s| dict.is_word_end(s));
        for ch in &mut path.chars[start..end] {
            ch.in_dictionary = valid;
        }
        if end < path.chars.len() {
            path.chars[end].in_dictionary = false;
        }
        start = end + 1;
    }
}
