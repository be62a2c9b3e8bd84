//! Text splitting.
//!
//! This module provides the [`Splitter`] trait and [`TextSplitter`], which
//! supports two [`ChunkMode`]s:
//!
//! - [`ChunkMode::MultiLines`]: packs consecutive lines into chunks bounded by
//!   a character and a token budget, optionally cutting at blank lines and
//!   repeating trailing lines between chunks
//! - [`ChunkMode::OneLine`]: a plain delimiter split, one chunk per segment
//!
//! Splitting never drops content. For `MultiLines`, the input is recovered by
//! joining every chunk's lines with the delimiter after skipping its first
//! `overlap` lines, and appending `continues_previous` pieces without one.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::document::{Chunk, ItemId, Metadata, MetadataValue};
use crate::error::{RagError, Result};
use crate::tokens::TokenCounter;

/// Model whose tokenizer is used when none is specified.
pub const DEFAULT_TOKENIZER_MODEL: &str = "gpt-4";

/// Metadata key holding the position of a chunk in its source.
pub const CHUNK_INDEX_KEY: &str = "chunk_index";
/// Metadata key holding the number of leading lines repeated from the previous chunk.
pub const OVERLAP_KEY: &str = "overlap";
/// Metadata key set on pieces of a segment that had to be split mid-line.
pub const CONTINUES_PREVIOUS_KEY: &str = "continues_previous";

/// How raw text is cut into chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum ChunkMode {
    /// Pack several lines per chunk.
    #[default]
    MultiLines,
    /// One chunk per delimiter-separated segment.
    OneLine,
}

impl ChunkMode {
    /// The configuration name of this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultiLines => "multi_lines",
            Self::OneLine => "one_line",
        }
    }
}

impl fmt::Display for ChunkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkMode {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "multi_lines" => Ok(Self::MultiLines),
            "one_line" => Ok(Self::OneLine),
            other => Err(RagError::Configuration(format!("unsupported chunk mode: {other}"))),
        }
    }
}

impl TryFrom<String> for ChunkMode {
    type Error = RagError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Parameters for [`TextSplitter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitOptions {
    /// Maximum number of characters per chunk.
    pub max_chunk_length: usize,
    /// Maximum number of tokens per chunk.
    pub max_chunk_tokens: usize,
    pub chunk_mode: ChunkMode,
    /// In `MultiLines` mode, cut an overflowing chunk right after its last
    /// blank line instead of at the overflow point.
    pub must_break_at_empty_line: bool,
    /// Number of trailing lines of a chunk repeated at the start of the next.
    pub overlap: usize,
    /// Segment delimiter.
    pub delimiter: String,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            max_chunk_length: 4000,
            max_chunk_tokens: 1024,
            chunk_mode: ChunkMode::MultiLines,
            must_break_at_empty_line: true,
            overlap: 0,
            delimiter: "\n".to_string(),
        }
    }
}

impl SplitOptions {
    /// Check that the limits are usable.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] if:
    /// - `max_chunk_length == 0` or `max_chunk_tokens == 0`
    /// - `overlap >= max_chunk_length`
    /// - the delimiter is empty
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_length == 0 {
            return Err(RagError::Configuration("max_chunk_length must be greater than zero".into()));
        }
        if self.max_chunk_tokens == 0 {
            return Err(RagError::Configuration("max_chunk_tokens must be greater than zero".into()));
        }
        if self.overlap >= self.max_chunk_length {
            return Err(RagError::Configuration(format!(
                "overlap ({}) must be less than max_chunk_length ({})",
                self.overlap, self.max_chunk_length
            )));
        }
        if self.delimiter.is_empty() {
            return Err(RagError::Configuration("delimiter must not be empty".into()));
        }
        Ok(())
    }
}

/// A strategy for splitting raw text into chunks.
pub trait Splitter: Send + Sync {
    /// Split `text` into chunks titled `title`.
    ///
    /// Returns an empty `Vec` for empty input.
    fn split(&self, text: &str, title: &str) -> Vec<Chunk>;
}

/// Delimiter-based splitter bounded by character and token budgets.
///
/// Chunk IDs are `{title}#{chunk_index}` when a title is given and random
/// otherwise. Each chunk carries `chunk_index` and `overlap` metadata.
///
/// # Example
///
/// ```rust,ignore
/// use adk_retrieval::{SplitOptions, Splitter, TextSplitter};
///
/// let splitter = TextSplitter::new(SplitOptions::default())?;
/// let chunks = splitter.split(&text, "guide.md");
/// ```
#[derive(Debug, Clone)]
pub struct TextSplitter {
    options: SplitOptions,
    counter: TokenCounter,
}

/// A chunk body before ids and metadata are assigned.
struct RawChunk {
    text: String,
    overlap: usize,
    continues: bool,
}

impl TextSplitter {
    /// Create a splitter counting tokens with the [`DEFAULT_TOKENIZER_MODEL`] tokenizer.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] if the options are invalid.
    pub fn new(options: SplitOptions) -> Result<Self> {
        let counter = TokenCounter::for_model(DEFAULT_TOKENIZER_MODEL)?;
        Self::with_counter(options, counter)
    }

    /// Create a splitter with an explicit token counter.
    pub fn with_counter(options: SplitOptions, counter: TokenCounter) -> Result<Self> {
        options.validate()?;
        Ok(Self { options, counter })
    }

    /// The options this splitter was built with.
    pub fn options(&self) -> &SplitOptions {
        &self.options
    }

    fn fits(&self, text: &str) -> bool {
        text.chars().count() <= self.options.max_chunk_length
            && self.counter.count(text) <= self.options.max_chunk_tokens
    }

    fn fits_with(&self, lines: &[&str], next: &str) -> bool {
        let delimiter = self.options.delimiter.as_str();
        let mut joined = lines.join(delimiter);
        if !lines.is_empty() {
            joined.push_str(delimiter);
        }
        joined.push_str(next);
        self.fits(&joined)
    }

    /// Cut a segment that exceeds the budgets into the longest fitting
    /// prefixes, on character boundaries.
    fn hard_split(&self, segment: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut rest = segment;
        while !rest.is_empty() {
            let available = rest.chars().count().min(self.options.max_chunk_length);
            let fits_prefix = |n: usize| self.fits(&rest[..prefix_end(rest, n)]);

            let take = if fits_prefix(available) {
                available
            } else {
                // Largest prefix within the token budget; at least one character.
                let (mut lo, mut hi) = (1, available);
                while lo < hi {
                    let mid = (lo + hi).div_ceil(2);
                    if fits_prefix(mid) { lo = mid } else { hi = mid - 1 }
                }
                lo
            };

            let end = prefix_end(rest, take);
            pieces.push(rest[..end].to_string());
            rest = &rest[end..];
        }
        pieces
    }

    fn split_multi_lines(&self, text: &str) -> Vec<RawChunk> {
        let delimiter = self.options.delimiter.as_str();
        let mut out = Vec::new();
        let mut queue: VecDeque<&str> = text.split(delimiter).collect();
        let mut current: Vec<&str> = Vec::new();
        // Leading lines of `current` repeated from the previous chunk.
        let mut carried = 0;

        while let Some(line) = queue.pop_front() {
            if self.fits_with(&current, line) {
                current.push(line);
                continue;
            }

            if current.len() == carried {
                if carried > 0 {
                    // The overlap alone leaves no room; start clean.
                    current.clear();
                    carried = 0;
                    queue.push_front(line);
                } else {
                    self.push_pieces(&mut out, line, false);
                }
                continue;
            }

            if current[carried..].iter().all(|l| l.is_empty()) {
                // Blank lines alone never form a chunk; they lead the next one.
                current.drain(..carried);
                carried = 0;
                if self.fits_with(&current, line) {
                    current.push(line);
                } else {
                    let mut segment = current.join(delimiter);
                    segment.push_str(delimiter);
                    segment.push_str(line);
                    current.clear();
                    self.push_pieces(&mut out, &segment, false);
                }
                continue;
            }

            let mut cut = current.len();
            if self.options.must_break_at_empty_line {
                if let Some(pos) =
                    current[carried + 1..].iter().rposition(|l| l.trim().is_empty())
                {
                    cut = carried + pos + 2;
                }
                if current[carried..cut].iter().all(|l| l.is_empty()) {
                    cut = current.len();
                }
            }

            let rest = current.split_off(cut);
            let tail_len = self.options.overlap.min(current.len() - carried);
            let tail = current[current.len() - tail_len..].to_vec();
            out.push(RawChunk { text: current.join(delimiter), overlap: carried, continues: false });

            current = tail;
            carried = tail_len;
            current.extend(rest);
            queue.push_front(line);
        }

        if current.len() > carried {
            if !out.is_empty() && current[carried..].iter().all(|l| l.is_empty()) {
                // Trailing blank lines continue the previous chunk.
                let segment = format!("{delimiter}{}", current[carried..].join(delimiter));
                self.push_pieces(&mut out, &segment, true);
            } else {
                out.push(RawChunk {
                    text: current.join(delimiter),
                    overlap: carried,
                    continues: false,
                });
            }
        }
        out
    }

    /// Hard-split `segment` and append the pieces; every piece after the
    /// first continues the previous one.
    fn push_pieces(&self, out: &mut Vec<RawChunk>, segment: &str, continues: bool) {
        for (i, piece) in self.hard_split(segment).into_iter().enumerate() {
            out.push(RawChunk { text: piece, overlap: 0, continues: continues || i > 0 });
        }
    }

    fn split_one_line(&self, text: &str) -> Vec<RawChunk> {
        let mut out = Vec::new();
        for segment in text.split(self.options.delimiter.as_str()).filter(|s| !s.is_empty()) {
            if self.fits(segment) {
                out.push(RawChunk { text: segment.to_string(), overlap: 0, continues: false });
            } else {
                self.push_pieces(&mut out, segment, false);
            }
        }
        out
    }
}

impl Splitter for TextSplitter {
    fn split(&self, text: &str, title: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return Vec::new();
        }

        let raw = match self.options.chunk_mode {
            ChunkMode::MultiLines => self.split_multi_lines(text),
            ChunkMode::OneLine => self.split_one_line(text),
        };

        raw.into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let mut metadata = Metadata::new();
                metadata.insert(CHUNK_INDEX_KEY.to_string(), MetadataValue::from(i));
                metadata.insert(OVERLAP_KEY.to_string(), MetadataValue::from(raw.overlap));
                if raw.continues {
                    metadata.insert(CONTINUES_PREVIOUS_KEY.to_string(), MetadataValue::Bool(true));
                }
                let id = if title.is_empty() {
                    ItemId::generate()
                } else {
                    ItemId::Str(format!("{title}#{i}"))
                };
                Chunk { id, title: title.to_string(), content: raw.text, metadata: Some(metadata) }
            })
            .collect()
    }
}

/// Split `text` with the given limits and mode, using defaults for every
/// other option.
///
/// # Errors
///
/// Returns [`RagError::Configuration`] for an unsupported `chunk_mode` or
/// invalid limits.
pub fn split_text(
    text: &str,
    max_chunk_length: usize,
    max_chunk_tokens: usize,
    chunk_mode: &str,
) -> Result<Vec<Chunk>> {
    let options = SplitOptions {
        max_chunk_length,
        max_chunk_tokens,
        chunk_mode: chunk_mode.parse()?,
        ..SplitOptions::default()
    };
    Ok(TextSplitter::new(options)?.split(text, ""))
}

/// Byte offset just past the first `n` characters of `s`.
fn prefix_end(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter(max_chunk_length: usize, overlap: usize, must_break: bool) -> TextSplitter {
        TextSplitter::new(SplitOptions {
            max_chunk_length,
            max_chunk_tokens: 10_000,
            overlap,
            must_break_at_empty_line: must_break,
            ..SplitOptions::default()
        })
        .unwrap()
    }

    fn overlap_of(chunk: &Chunk) -> i64 {
        match chunk.metadata.as_ref().and_then(|m| m.get(OVERLAP_KEY)) {
            Some(MetadataValue::Int(n)) => *n,
            _ => panic!("missing overlap metadata"),
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(splitter(10, 0, true).split("", "t").is_empty());
    }

    #[test]
    fn short_input_yields_single_chunk() {
        let chunks = splitter(100, 0, true).split("line one\n\nline two", "doc");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "line one\n\nline two");
        assert_eq!(chunks[0].id, ItemId::from("doc#0"));
    }

    #[test]
    fn unsupported_mode_is_named_in_error() {
        let err = split_text("abc", 10, 10, "paragraphs").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("paragraphs"));
    }

    #[test]
    fn chunk_mode_deserializes_from_config_names() {
        let mode: ChunkMode = serde_json::from_str("\"one_line\"").unwrap();
        assert_eq!(mode, ChunkMode::OneLine);
        assert!(serde_json::from_str::<ChunkMode>("\"sentences\"").is_err());
        assert_eq!(serde_json::to_string(&ChunkMode::MultiLines).unwrap(), "\"multi_lines\"");
    }

    #[test]
    fn overlap_must_be_smaller_than_length() {
        let options = SplitOptions { max_chunk_length: 4, overlap: 4, ..SplitOptions::default() };
        assert!(TextSplitter::new(options).unwrap_err().is_configuration());
    }

    #[test]
    fn prefers_breaking_at_blank_lines() {
        let text = "aaaa\nbbbb\n\ncccc\ndddd";

        let chunks = splitter(16, 0, true).split(text, "");
        let contents: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["aaaa\nbbbb\n", "cccc\ndddd"]);

        let chunks = splitter(16, 0, false).split(text, "");
        let contents: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["aaaa\nbbbb\n\ncccc", "dddd"]);
    }

    #[test]
    fn repeats_trailing_lines_as_overlap() {
        let chunks = splitter(8, 1, false).split("l1\nl2\nl3\nl4\nl5\nl6", "");
        let contents: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["l1\nl2\nl3", "l3\nl4\nl5", "l5\nl6"]);
        assert_eq!(overlap_of(&chunks[0]), 0);
        assert_eq!(overlap_of(&chunks[1]), 1);
        assert_eq!(overlap_of(&chunks[2]), 1);
    }

    #[test]
    fn hard_splits_overlong_lines() {
        let chunks = splitter(4, 0, true).split("abcdefghij\nxy", "");
        let contents: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["abcd", "efgh", "ij", "xy"]);
        let continues: Vec<_> = chunks
            .iter()
            .map(|c| c.metadata.as_ref().unwrap().contains_key(CONTINUES_PREVIOUS_KEY))
            .collect();
        assert_eq!(continues, vec![false, true, true, false]);
    }

    #[test]
    fn blank_lines_never_form_their_own_chunk() {
        let chunks = splitter(5, 0, true).split("\nabcdefgh", "doc");
        let contents: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["\nabcd", "efgh"]);

        let chunks = splitter(5, 0, true).split("abcde\n", "doc");
        let contents: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["abcde", "\n"]);
        assert!(chunks[1].metadata.as_ref().unwrap().contains_key(CONTINUES_PREVIOUS_KEY));
    }

    #[test]
    fn respects_token_budget() {
        let options = SplitOptions {
            max_chunk_length: 10_000,
            max_chunk_tokens: 4,
            ..SplitOptions::default()
        };
        let splitter = TextSplitter::new(options).unwrap();
        let counter = TokenCounter::for_model(DEFAULT_TOKENIZER_MODEL).unwrap();
        let text = "alpha beta\ngamma delta\nepsilon zeta\neta theta iota kappa lambda";
        let chunks = splitter.split(text, "");
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(counter.count(&chunk.content) <= 4, "chunk over budget: {:?}", chunk.content);
        }
    }

    #[test]
    fn one_line_mode_splits_on_delimiter() {
        let options = SplitOptions {
            chunk_mode: ChunkMode::OneLine,
            delimiter: ";".to_string(),
            ..SplitOptions::default()
        };
        let chunks = TextSplitter::new(options).unwrap().split("a;b;;c", "");
        let contents: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }
}
