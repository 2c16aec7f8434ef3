//! Running topic summary compression

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::token_estimator::{TokenEstimator, WordBasedEstimator};
use crate::router::{ModelBackend, ModelRequest};

/// Summarizer trait for different summarization strategies
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize a list of text segments into a concise brief
    async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String, SummarizerError>;
}

/// Model-backed summarizer; sends the segments to a registered backend
pub struct ModelSummarizer {
    backend: Arc<dyn ModelBackend>,
    temperature: f32,
}

impl ModelSummarizer {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            temperature: 0.3,
        }
    }

    fn build_prompt(&self, texts: &[String], max_tokens: usize) -> String {
        let combined = texts.join("\n\n---\n\n");
        format!(
            "Summarize the following presentation notes into a concise running brief. \
            Keep entity names, figures and open questions. \
            Keep the summary under {} tokens.\n\n{}",
            max_tokens, combined
        )
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String, SummarizerError> {
        if texts.is_empty() {
            return Ok(String::new());
        }

        debug!(
            "Summarizing {} text segments with {}, target: {} tokens",
            texts.len(),
            self.backend.name(),
            max_tokens
        );

        let request = ModelRequest {
            system: "You are a concise summarizer. Extract key information and compress it efficiently."
                .to_string(),
            prompt: self.build_prompt(texts, max_tokens),
            max_tokens,
            temperature: self.temperature,
        };

        match self.backend.invoke(&request).await {
            Ok(response) => Ok(response.text),
            Err(e) => {
                warn!("Summarization via {} failed: {}", self.backend.name(), e);
                Err(SummarizerError::Backend(e.to_string()))
            }
        }
    }
}

/// Concatenation summarizer (fallback)
///
/// Keeps the newest segments that fit in `max_tokens`, oldest dropped first.
pub struct ConcatenationSummarizer {
    estimator: Arc<dyn TokenEstimator>,
}

impl ConcatenationSummarizer {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }
}

impl Default for ConcatenationSummarizer {
    fn default() -> Self {
        Self::new(Arc::new(WordBasedEstimator::default()))
    }
}

#[async_trait]
impl Summarizer for ConcatenationSummarizer {
    async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String, SummarizerError> {
        let mut kept: Vec<&str> = Vec::new();
        let mut used = 0;

        for text in texts.iter().rev() {
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            let tokens = self.estimator.estimate(text);
            if used + tokens > max_tokens {
                break;
            }
            used += tokens;
            kept.push(text);
        }

        kept.reverse();
        Ok(kept.join("\n"))
    }
}

/// Summarizer errors
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Unknown error")]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concatenation_summarizer() {
        let summarizer = ConcatenationSummarizer::default();
        let texts = vec!["Hello".to_string(), "World".to_string()];
        let result = summarizer.summarize(&texts, 100).await.unwrap();
        assert_eq!(result, "Hello\nWorld");
    }

    #[tokio::test]
    async fn test_concatenation_drops_oldest_over_budget() {
        let summarizer = ConcatenationSummarizer::new(Arc::new(WordBasedEstimator::new(1.0)));
        let texts = vec![
            "oldest segment words".to_string(),
            "middle".to_string(),
            "newest".to_string(),
        ];
        let result = summarizer.summarize(&texts, 2).await.unwrap();
        assert_eq!(result, "middle\nnewest");
    }
}
