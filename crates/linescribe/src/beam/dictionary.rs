//! Language-model queries used to steer the beam search.

use crate::{LinescribeError, Result};
use ahash::AHashMap;
use std::path::Path;

/// Opaque position inside a dictionary automaton.
pub type DictState = u32;

/// Default floor below which a word's certainty disqualifies it as a dictionary match.
pub const DEFAULT_WORST_CERTAINTY: f32 = -10.0;

/// Query contract between the decoder and a word dictionary.
///
/// The decoder walks one automaton state per hypothesis, feeding it each
/// completed character of the current word. Words are delimited by spaces,
/// which are never passed to [`Dictionary::advance`].
pub trait Dictionary: Send + Sync {
    /// State before the first character of a word.
    fn start(&self) -> DictState;

    /// State after appending `unichar`, or `None` when no word has that prefix.
    fn advance(&self, state: DictState, unichar: &str) -> Option<DictState>;

    /// Whether `state` ends a complete word.
    fn is_word_end(&self, state: DictState) -> bool;

    /// Final verdict on a recognized word with the given (minimum character) certainty.
    fn accept_word(&self, word: &str, certainty: f32) -> bool;

    /// Word certainty below which dictionary scoring is withdrawn.
    fn worst_certainty(&self) -> f32 {
        DEFAULT_WORST_CERTAINTY
    }
}

#[derive(Debug, Default, Clone)]
struct TrieNode {
    children: AHashMap<String, DictState>,
    is_word_end: bool,
}

/// A dictionary backed by a trie over a plain word list.
#[derive(Debug, Clone)]
pub struct WordListDictionary {
    nodes: Vec<TrieNode>,
    num_words: usize,
    worst_certainty: f32,
}

impl Default for WordListDictionary {
    fn default() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
            num_words: 0,
            worst_certainty: DEFAULT_WORST_CERTAINTY,
        }
    }
}

impl WordListDictionary {
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut dict = Self::default();
        for word in words {
            dict.insert(word.as_ref());
        }
        dict
    }

    /// One word per line; surrounding whitespace and blank lines are ignored.
    pub fn parse(contents: &str) -> Self {
        Self::from_words(contents.lines().map(str::trim).filter(|w| !w.is_empty()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LinescribeError::validation_with_source(format!("Failed to read word list {}", path.display()), e)
        })?;
        let dict = Self::parse(&contents);
        tracing::debug!(path = %path.display(), words = dict.num_words, "loaded word list");
        Ok(dict)
    }

    pub fn with_worst_certainty(mut self, worst_certainty: f32) -> Self {
        self.worst_certainty = worst_certainty;
        self
    }

    pub fn insert(&mut self, word: &str) {
        if word.is_empty() {
            return;
        }
        let mut state = 0usize;
        for ch in word.chars() {
            let key = ch.to_string();
            state = match self.nodes[state].children.get(&key) {
                Some(&next) => next as usize,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[state].children.insert(key, next as DictState);
                    next
                }
            };
        }
        if !self.nodes[state].is_word_end {
            self.nodes[state].is_word_end = true;
            self.num_words += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.num_words
    }

    pub fn is_empty(&self) -> bool {
        self.num_words == 0
    }

    pub fn contains(&self, word: &str) -> bool {
        let mut state = Some(self.start());
        for ch in word.chars() {
            let mut buf = [0u8; 4];
            state = state.and_then(|s| self.advance(s, ch.encode_utf8(&mut buf)));
        }
        state.is_some_and(|s| self.is_word_end(s))
    }
}

impl Dictionary for WordListDictionary {
    fn start(&self) -> DictState {
        0
    }

    /// Multi-character entries walk the trie one `char` at a time.
    fn advance(&self, state: DictState, unichar: &str) -> Option<DictState> {
        let mut state = state;
        let mut buf = [0u8; 4];
        for ch in unichar.chars() {
            let node = self.nodes.get(state as usize)?;
            state = *node.children.get(&*ch.encode_utf8(&mut buf))?;
        }
        Some(state)
    }

    fn is_word_end(&self, state: DictState) -> bool {
        self.nodes.get(state as usize).is_some_and(|n| n.is_word_end)
    }

    fn accept_word(&self, word: &str, certainty: f32) -> bool {
        let core = word.trim_matches(|c: char| c.is_ascii_punctuation());
        !core.is_empty() && certainty >= self.worst_certainty && (self.contains(core) || self.contains(word))
    }

    fn worst_certainty(&self) -> f32 {
        self.worst_certainty
    }
}
