//! The character set a model recognizes.

use crate::{LinescribeError, Result};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Id of the space character in every character set.
pub const SPACE_ID: usize = 0;
pub const SPACE: &str = " ";

/// Ordered table of recognizable characters.
///
/// An entry is usually one `char` but may be a short sequence (a ligature or a
/// base plus combining mark). Entry 0 is always the space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Unicharset {
    entries: Vec<String>,
    #[serde(skip)]
    index: AHashMap<String, usize>,
    #[serde(skip)]
    max_entry_chars: usize,
}

impl From<Vec<String>> for Unicharset {
    fn from(entries: Vec<String>) -> Self {
        Self::from_entries(entries)
    }
}

impl From<Unicharset> for Vec<String> {
    fn from(set: Unicharset) -> Self {
        set.entries
    }
}

impl Unicharset {
    /// Build from entries, putting the space first and dropping duplicates and empties.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self {
            entries: Vec::new(),
            index: AHashMap::new(),
            max_entry_chars: 0,
        };
        set.insert(SPACE.to_string());
        for entry in entries {
            let entry = entry.into();
            if !entry.is_empty() {
                set.insert(entry);
            }
        }
        set
    }

    /// One entry per character of `text`.
    pub fn from_text(text: &str) -> Self {
        Self::from_entries(text.chars().map(String::from))
    }

    /// Parse a character-set file: one entry per line, blank lines ignored.
    ///
    /// A line holding only `<space>` denotes the space character.
    pub fn parse(contents: &str) -> Self {
        Self::from_entries(contents.lines().map(|line| {
            let line = line.trim_end_matches('\r');
            if line == "<space>" { SPACE.to_string() } else { line.to_string() }
        }))
    }

    fn insert(&mut self, entry: String) {
        if self.index.contains_key(&entry) {
            return;
        }
        self.max_entry_chars = self.max_entry_chars.max(entry.chars().count());
        self.index.insert(entry.clone(), self.entries.len());
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    pub fn id_of(&self, entry: &str) -> Option<usize> {
        self.index.get(entry).copied()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.index.contains_key(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Split `text` into ids, preferring the longest matching entry.
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        let mut ids = Vec::with_capacity(text.len());
        let mut rest = text;
        while !rest.is_empty() {
            let ends: Vec<usize> = rest
                .char_indices()
                .skip(1)
                .map(|(i, _)| i)
                .chain(std::iter::once(rest.len()))
                .take(self.max_entry_chars.max(1))
                .collect();
            let Some((end, id)) = ends.iter().rev().find_map(|&end| self.id_of(&rest[..end]).map(|id| (end, id))) else {
                let bad = rest.chars().next().unwrap_or_default();
                return Err(LinescribeError::validation(format!(
                    "character {bad:?} is not in the model's character set"
                )));
            };
            ids.push(id);
            rest = &rest[end..];
        }
        Ok(ids)
    }

    /// Concatenated text of `ids`; unknown ids are skipped.
    pub fn decode(&self, ids: &[usize]) -> String {
        ids.iter().filter_map(|&id| self.get(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_is_first() {
        let set = Unicharset::from_text("ab c");
        assert_eq!(set.get(SPACE_ID), Some(" "));
        assert_eq!(set.len(), 4);
        assert_eq!(set.id_of("a"), Some(1));
        assert_eq!(set.id_of("c"), Some(3));
    }

    #[test]
    fn test_encode_prefers_longest_entry() {
        let set = Unicharset::from_entries(["f", "i", "fi"]);
        assert_eq!(set.encode("fif").unwrap(), vec![3, 1]);
        assert_eq!(set.decode(&[3, 0, 1]), "fi f");
    }

    #[test]
    fn test_encode_unknown_character() {
        let set = Unicharset::from_text("abc");
        let err = set.encode("abd").unwrap_err();
        assert!(err.to_string().contains("'d'"));
    }

    #[test]
    fn test_parse_charset_file() {
        let set = Unicharset::parse("<space>\na\r\nb\n\nb\n");
        assert_eq!(set.len(), 3);
        assert_eq!(set.get(2), Some("b"));
    }

    #[test]
    fn test_serde_rebuilds_index() {
        let set = Unicharset::from_text("xyz");
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"[" ","x","y","z"]"#);
        let back: Unicharset = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id_of("z"), Some(3));
    }
}
