//! Heuristic token estimation
//!
//! Adapters without a vendor tokenizer estimate roughly one token per four
//! characters. Estimates only need to be monotonic in text length and
//! consistent between calls; the context budgeter relies on nothing more.

/// Average characters per token for English prose
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Character-ratio token estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenCounter {
    chars_per_token: f64,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::with_ratio(DEFAULT_CHARS_PER_TOKEN)
    }

    /// Ratios below one character per token are clamped to one
    pub fn with_ratio(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1.0),
        }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Estimated tokens in `text`; at least 1 for non-empty text
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count() as f64;
        let estimated = (chars / self.chars_per_token).ceil() as usize;
        estimated.max(1)
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}
