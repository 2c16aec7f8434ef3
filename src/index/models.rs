//! Retrieval data models and index configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::fmt;

use super::embedder::EmbedderConfig;
use super::fusion::FusionStrategy;
use crate::chunking::Chunk;

/// Which signals a search uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Dense,
    Lexical,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn uses_dense(&self) -> bool {
        matches!(self, SearchMode::Dense | SearchMode::Hybrid)
    }

    pub fn uses_lexical(&self) -> bool {
        matches!(self, SearchMode::Lexical | SearchMode::Hybrid)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SearchMode::Dense => "dense",
            SearchMode::Lexical => "lexical",
            SearchMode::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

/// Retrieval request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub text: String,
    pub top_k: usize,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            mode: SearchMode::Hybrid,
            session_id: None,
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Ranked search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk: Chunk,
    /// Fused score for hybrid search, raw signal score otherwise
    pub score: f64,
    pub dense_score: Option<f64>,
    pub lexical_score: Option<f64>,
}

/// Index statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub chunks: usize,
    pub documents: usize,
    pub vocabulary: usize,
    pub dimensions: usize,
    pub embedder: String,
}

/// Embedding index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub fusion: FusionStrategy,

    #[serde(default = "default_dense_weight")]
    pub dense_weight: f64,

    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,

    /// Dense candidates below this cosine similarity are ignored
    #[serde(default = "default_min_dense_score")]
    pub min_dense_score: f64,

    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,

    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,

    #[serde(default = "default_query_cache_capacity")]
    pub query_cache_capacity: u64,

    #[serde(default)]
    pub embedder: EmbedderConfig,

    /// Loaded at startup and written on save when set
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

fn default_dense_weight() -> f64 {
    0.6
}

fn default_lexical_weight() -> f64 {
    0.4
}

fn default_min_dense_score() -> f64 {
    0.25
}

fn default_bm25_k1() -> f64 {
    1.2
}

fn default_bm25_b() -> f64 {
    0.75
}

fn default_query_cache_capacity() -> u64 {
    1_000
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            fusion: FusionStrategy::default(),
            dense_weight: default_dense_weight(),
            lexical_weight: default_lexical_weight(),
            min_dense_score: default_min_dense_score(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            query_cache_capacity: default_query_cache_capacity(),
            embedder: EmbedderConfig::default(),
            snapshot_path: None,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.dense_weight < 0.0 || self.lexical_weight < 0.0 {
            return Err("fusion weights must be non-negative".to_string());
        }
        if self.dense_weight + self.lexical_weight <= 0.0 {
            return Err("at least one fusion weight must be positive".to_string());
        }
        if !(-1.0..=1.0).contains(&self.min_dense_score) {
            return Err("min_dense_score must be within [-1, 1]".to_string());
        }
        if self.bm25_k1 < 0.0 || !(0.0..=1.0).contains(&self.bm25_b) {
            return Err("bm25 parameters out of range".to_string());
        }
        if self.embedder.dimensions == 0 {
            return Err("embedding dimensions must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(IndexConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_weights_rejected() {
        let config = IndexConfig {
            dense_weight: 0.0,
            lexical_weight: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_query_builder() {
        let q = RetrievalQuery::new("revenue", 5)
            .with_mode(SearchMode::Lexical)
            .for_session("s1");
        assert!(!q.mode.uses_dense());
        assert_eq!(q.session_id.as_deref(), Some("s1"));
    }
}
