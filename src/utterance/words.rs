//! Word segmentation for progress reporting

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A word currently being rendered, located in the utterance text.
///
/// `range` is a half-open byte range on character boundaries, so
/// `&text[range]` always yields `word`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordBoundary {
    pub word: String,
    pub range: Range<usize>,
}

impl WordBoundary {
    /// Slice the word back out of the text it was produced from
    pub fn slice<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.get(self.range.clone())
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '\'' || c == '\u{2019}'
}

/// Split `text` into words.
///
/// A word is a maximal run of alphanumeric characters, with apostrophes kept
/// when they sit between two word characters ("don't").
pub fn word_boundaries(text: &str) -> Vec<WordBoundary> {
    let mut words = Vec::new();
    let mut start: Option<usize> = None;

    for (idx, c) in text.char_indices() {
        match (start, is_word_char(c)) {
            (None, true) => start = Some(idx),
            (Some(s), false) => {
                push_word(text, s, idx, &mut words);
                start = None;
            }
            _ => {}
        }
    }

    if let Some(s) = start {
        push_word(text, s, text.len(), &mut words);
    }

    words
}

fn push_word(text: &str, start: usize, end: usize, out: &mut Vec<WordBoundary>) {
    // Trim apostrophes used as quotes
    let slice = &text[start..end];
    let trimmed_start = slice.len() - slice.trim_start_matches(['\'', '\u{2019}']).len();
    let trimmed = slice.trim_matches(['\'', '\u{2019}']);
    if trimmed.is_empty() {
        return;
    }

    let begin = start + trimmed_start;
    out.push(WordBoundary {
        word: trimmed.to_string(),
        range: begin..begin + trimmed.len(),
    });
}
