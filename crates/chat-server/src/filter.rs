//! Profanity detection and redaction.
//!
//! Matching is case-insensitive substring matching. Redaction replaces
//! each matched word with asterisks of the same length, so the message
//! shape survives while the word does not.

use std::io;
use std::path::Path;

/// Words used when no forbidden-words file is configured.
const BUILT_IN_WORDS: &[&str] = &["damn", "hell", "crap", "bloody", "frigging"];

/// Checks for and redacts forbidden words in message text.
#[derive(Debug, Clone)]
pub struct ProfanityFilter {
    /// Lowercased word list, checked in order.
    words: Vec<String>,
}

impl Default for ProfanityFilter {
    fn default() -> Self {
        ProfanityFilter::from_words(BUILT_IN_WORDS.iter().map(|w| (*w).to_string()))
    }
}

impl ProfanityFilter {
    pub fn from_words(words: impl IntoIterator<Item = String>) -> Self {
        let words = words
            .into_iter()
            .map(|w| w.trim().to_ascii_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        ProfanityFilter { words }
    }

    /// Loads a newline-separated word list. Blank lines are skipped.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(ProfanityFilter::from_words(
            contents.lines().map(str::to_string),
        ))
    }

    /// True when `text` contains any forbidden word, ignoring case.
    pub fn contains_profanity(&self, text: &str) -> bool {
        let lowered = text.to_ascii_lowercase();
        self.words.iter().any(|w| lowered.contains(w.as_str()))
    }

    /// Replaces every occurrence of a forbidden word with asterisks of
    /// the same length.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for word in &self.words {
            out = replace_ignore_case(&out, word);
        }
        out
    }
}

fn replace_ignore_case(text: &str, word: &str) -> String {
    let lowered = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(found) = lowered.get(pos..).and_then(|hay| hay.find(word)) {
        let start = pos + found;
        let end = start + word.len();
        if let Some(prefix) = text.get(pos..start) {
            out.push_str(prefix);
        }
        for _ in 0..word.chars().count() {
            out.push('*');
        }
        pos = end;
    }
    if let Some(rest) = text.get(pos..) {
        out.push_str(rest);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn filter() -> ProfanityFilter {
        ProfanityFilter::from_words(["badword".to_string(), "worse".to_string()])
    }

    #[test]
    fn detects_ignoring_case() {
        let f = filter();
        assert!(f.contains_profanity("this is a BadWord in a sentence"));
        assert!(f.contains_profanity("WORSE"));
        assert!(!f.contains_profanity("perfectly fine text"));
    }

    #[test]
    fn redacts_with_matching_length() {
        let f = filter();
        assert_eq!(f.redact("a badword here"), "a ******* here");
        assert_eq!(f.redact("BADWORD and worse"), "******* and *****");
    }

    #[test]
    fn redacts_embedded_occurrences() {
        let f = filter();
        assert_eq!(f.redact("superbadwordish"), "super*******ish");
    }

    #[test]
    fn clean_text_is_untouched() {
        let f = filter();
        assert_eq!(f.redact("nothing to see"), "nothing to see");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let f = ProfanityFilter::from_words(["".to_string(), "  ".to_string(), "x".to_string()]);
        assert!(f.contains_profanity("box"));
        assert!(!f.contains_profanity("yyy"));
    }
}
