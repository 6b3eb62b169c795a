//! Incremental sentence segmentation over streamed text deltas.
//!
//! A boundary is terminal punctuation (`.`, `!`, `?`) followed by at least
//! one whitespace character. The whitespace run belongs to the sentence it
//! terminates, so concatenating every sentence's [`Sentence::raw`] text gives
//! back the input exactly. Abbreviations ("Dr. Smith") and decimals followed
//! by a space split early; that is a known limitation.

use once_cell::sync::Lazy;
use regex::Regex;

static BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]\s+").expect("sentence boundary pattern"));

/// A unit of text to be voiced as one synthesis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    index: usize,
    raw: String,
    language: String,
}

impl Sentence {
    pub fn new(index: usize, raw: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            index,
            raw: raw.into(),
            language: language.into(),
        }
    }

    /// Position in the session, starting at zero with no gaps.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The exact span of input, trailing whitespace included.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The span with surrounding whitespace trimmed.
    pub fn text(&self) -> &str {
        self.raw.trim()
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn is_blank(&self) -> bool {
        self.text().is_empty()
    }
}

/// Accumulates text deltas and releases complete sentences as soon as a
/// boundary is seen.
#[derive(Debug)]
pub struct SentenceSegmenter {
    language: String,
    buffer: String,
    next_index: usize,
    flushed: bool,
}

impl SentenceSegmenter {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            buffer: String::new(),
            next_index: 0,
            flushed: false,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Text received but not yet released as a sentence.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Appends a delta and returns every sentence it completed, in order.
    /// Deltas arriving after [`flush`](Self::flush) are ignored.
    pub fn ingest(&mut self, delta: &str) -> Vec<Sentence> {
        if self.flushed || delta.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(delta);

        let cuts: Vec<usize> = BOUNDARY.find_iter(&self.buffer).map(|m| m.end()).collect();
        let Some(&last) = cuts.last() else {
            return Vec::new();
        };

        let tail = self.buffer.split_off(last);
        let complete = std::mem::replace(&mut self.buffer, tail);

        let mut sentences = Vec::with_capacity(cuts.len());
        let mut start = 0;
        for end in cuts {
            sentences.push(self.emit(&complete[start..end]));
            start = end;
        }
        sentences
    }

    /// Releases whatever remains as a final sentence. Returns `Some` exactly
    /// once per segmenter, even when the remainder is blank; callers decide
    /// whether a blank sentence is worth voicing.
    pub fn flush(&mut self) -> Option<Sentence> {
        if self.flushed {
            return None;
        }
        self.flushed = true;
        let rest = std::mem::take(&mut self.buffer);
        Some(self.emit(&rest))
    }

    fn emit(&mut self, raw: &str) -> Sentence {
        let sentence = Sentence::new(self.next_index, raw, self.language.clone());
        self.next_index += 1;
        sentence
    }
}

/// Segments a complete text in one go, dropping a blank trailing remainder.
pub fn segment_text(text: &str, language: &str) -> Vec<Sentence> {
    let mut segmenter = SentenceSegmenter::new(language);
    let mut sentences = segmenter.ingest(text);
    if let Some(rest) = segmenter.flush() {
        if !rest.is_blank() {
            sentences.push(rest);
        }
    }
    sentences
}
