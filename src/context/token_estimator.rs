//! Token estimation using tiktoken

use crate::error::{ContextError, Result};
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for multiple texts
    fn estimate_batch(&self, texts: &[&str]) -> Vec<usize> {
        texts.iter().map(|t| self.estimate(t)).collect()
    }
}

/// Tiktoken-based token estimator using cl100k_base (GPT-4, GPT-3.5-turbo)
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base()
            .map_err(|e| ContextError::Configuration(format!("tiktoken init: {}", e)))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Word-based token estimator (fallback, ~1.3 tokens per word)
///
/// Deterministic and allocation-free, so it is the default for chunking.
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

/// Build the estimator named in configuration ("word" or "tiktoken")
pub fn estimator_from_name(name: &str) -> Result<Arc<dyn TokenEstimator>> {
    match name {
        "word" | "words" => Ok(Arc::new(WordBasedEstimator::default())),
        "tiktoken" | "cl100k_base" => Ok(Arc::new(TiktokenEstimator::new()?)),
        other => Err(ContextError::Configuration(format!(
            "unknown token estimator '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiktoken_estimator() {
        let estimator = TiktokenEstimator::new().unwrap();
        let text = "Hello, world! This is a test.";
        let tokens = estimator.estimate(text);
        assert!(tokens > 0);
        assert!(tokens < 20);
    }

    #[test]
    fn test_word_based_estimator() {
        let estimator = WordBasedEstimator::default();
        let tokens = estimator.estimate("Hello world test");
        assert_eq!(tokens, 4); // 3 words * 1.3 = 3.9 -> 4
    }

    #[test]
    fn test_batch_estimation() {
        let estimator = WordBasedEstimator::new(1.0);
        let tokens = estimator.estimate_batch(&["one", "two words", ""]);
        assert_eq!(tokens, vec![1, 2, 0]);
    }

    #[test]
    fn test_estimator_from_name() {
        assert!(estimator_from_name("word").is_ok());
        assert!(estimator_from_name("sentencepiece").is_err());
    }
}
