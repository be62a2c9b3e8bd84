//! Token counting and model context windows.

use std::fmt;
use std::sync::Arc;

use crate::error::{RagError, Result};

/// Context window assumed for models missing from the lookup table.
pub const DEFAULT_CONTEXT_WINDOW: usize = 4096;

/// Context window size (in tokens) of a chat model.
///
/// Versioned names (`gpt-4-0613`, `gpt-4o-mini`) resolve to their family.
/// Unknown models fall back to [`DEFAULT_CONTEXT_WINDOW`].
pub fn context_window(model: &str) -> usize {
    let model = model.trim().to_ascii_lowercase();
    // Longest prefixes first so "gpt-4-32k" is not taken for "gpt-4".
    const TABLE: &[(&str, usize)] = &[
        ("gpt-3.5-turbo-16k", 16_385),
        ("gpt-3.5-turbo", 4_096),
        ("gpt-4-turbo", 128_000),
        ("gpt-4-1106", 128_000),
        ("gpt-4-0125", 128_000),
        ("gpt-4-32k", 32_768),
        ("gpt-4o", 128_000),
        ("gpt-4.1", 128_000),
        ("gpt-4", 8_192),
    ];
    TABLE
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, size)| *size)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

/// Token counter using tiktoken-rs for BPE tokenization.
#[derive(Clone)]
pub struct TokenCounter {
    bpe: Arc<tiktoken_rs::CoreBPE>,
}

impl TokenCounter {
    /// Create a token counter for the given model.
    /// Falls back to `cl100k_base` if the model isn't recognized.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] if no encoding can be loaded.
    pub fn for_model(model: &str) -> Result<Self> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .or_else(|_| tiktoken_rs::cl100k_base())
            .map_err(|e| {
                RagError::Configuration(format!("failed to load tokenizer for '{model}': {e}"))
            })?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    /// Count the number of tokens in a string.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

impl fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCounter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_window_prefers_longest_family() {
        assert_eq!(context_window("gpt-4"), 8_192);
        assert_eq!(context_window("gpt-4-32k-0613"), 32_768);
        assert_eq!(context_window("gpt-4o-mini"), 128_000);
        assert_eq!(context_window("gpt-3.5-turbo-16k"), 16_385);
        assert_eq!(context_window("some-local-model"), DEFAULT_CONTEXT_WINDOW);
    }

    #[test]
    fn counts_tokens_for_unknown_models() {
        let counter = TokenCounter::for_model("not-a-real-model").unwrap();
        assert_eq!(counter.count(""), 0);
        assert!(counter.count("hello world") >= 2);
    }
}
