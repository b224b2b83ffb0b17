//! Token estimation using tiktoken, with deterministic fallbacks

use super::models::ChatMessage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

/// Formatting overhead charged per turn (role markers and separators)
pub const PER_TURN_OVERHEAD: usize = 4;

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;
}

/// The BPE tables could not be loaded
#[derive(Debug, thiserror::Error)]
#[error("Failed to load tokenizer: {0}")]
pub struct TokenizerError(String);

/// Tiktoken-based token estimator using cl100k_base (GPT-4, GPT-3.5-turbo)
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> Result<Self, TokenizerError> {
        let bpe = cl100k_base().map_err(|e| TokenizerError(e.to_string()))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Length-based estimator: one token per two characters
#[derive(Debug, Default, Clone, Copy)]
pub struct CharLengthEstimator;

impl TokenEstimator for CharLengthEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count() / 2
    }
}

/// Word-based token estimator (~1.3 tokens per word by default)
#[derive(Debug, Clone, Copy)]
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 * self.tokens_per_word).ceil() as usize
    }
}

/// Tokenizer selection from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    #[default]
    Cl100k,
    Chars,
    Words,
}

/// Counts tokens for single strings and for whole windows.
///
/// Counting never fails: when the configured tokenizer cannot be loaded the
/// counter falls back to [`CharLengthEstimator`].
#[derive(Clone)]
pub struct TokenCounter {
    estimator: Arc<dyn TokenEstimator>,
}

impl TokenCounter {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }

    pub fn from_kind(kind: TokenizerKind) -> Self {
        let estimator: Arc<dyn TokenEstimator> = match kind {
            TokenizerKind::Cl100k => match TiktokenEstimator::new() {
                Ok(estimator) => Arc::new(estimator),
                Err(e) => {
                    warn!("tiktoken unavailable ({}), falling back to length heuristic", e);
                    Arc::new(CharLengthEstimator)
                }
            },
            TokenizerKind::Chars => Arc::new(CharLengthEstimator),
            TokenizerKind::Words => Arc::new(WordBasedEstimator::default()),
        };
        Self::new(estimator)
    }

    pub fn count(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    /// Sum of content tokens plus [`PER_TURN_OVERHEAD`] for every message
    pub fn count_batch(&self, messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|m| self.count(&m.content) + PER_TURN_OVERHEAD)
            .sum()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::from_kind(TokenizerKind::default())
    }
}
