//! Embedding providers

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::lexical::tokenize;
use crate::error::{ContextError, Result};

/// Embedding provider trait
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Embed a single text. Empty text is an error.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts, preserving order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Embedder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// "hashing" (local, deterministic) or "http" (OpenAI-compatible endpoint)
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_provider() -> String {
    "hashing".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_endpoint() -> String {
    "http://localhost:8080/v1/embeddings".to_string()
}

fn default_model() -> String {
    "text-embedding-004".to_string()
}

fn default_api_key_env() -> String {
    "EMBEDDING_API_KEY".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            dimensions: default_dimensions(),
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Build the embedder named in configuration
pub fn embedder_from_config(config: &EmbedderConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dimensions))),
        "http" => {
            let api_key = std::env::var(&config.api_key_env).ok().map(SecretString::new);
            Ok(Arc::new(HttpEmbedder::new(config.clone(), api_key)?))
        }
        other => Err(ContextError::Configuration(format!(
            "unknown embedding provider '{}'",
            other
        ))),
    }
}

/// Cosine similarity; zero vectors score 0
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na <= f64::EPSILON || nb <= f64::EPSILON {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Feature-hashing embedder.
///
/// Terms are hashed (FNV-1a) into fixed buckets and weighted by term
/// frequency, then L2 normalized. Deterministic and always available.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(term: &str, dims: usize) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h as usize) % dims
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let tokens = tokenize(text);
        let mut vec = vec![0.0f32; self.dimensions];
        if tokens.is_empty() {
            return vec;
        }

        let mut tf: HashMap<&str, f32> = HashMap::new();
        for tok in &tokens {
            *tf.entry(tok.as_str()).or_default() += 1.0;
        }

        let total = tokens.len() as f32;
        for (term, count) in tf {
            let weight = (count / total) * (1.0 + (term.len() as f32).ln());
            vec[Self::bucket(term, self.dimensions)] += weight;
        }

        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(ContextError::Embedding("text cannot be empty".to_string()));
        }
        Ok(self.vectorize(text))
    }
}

/// OpenAI-compatible `/embeddings` client
pub struct HttpEmbedder {
    client: Client,
    config: EmbedderConfig,
    api_key: Option<SecretString>,
}

impl HttpEmbedder {
    pub fn new(config: EmbedderConfig, api_key: Option<SecretString>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ContextError::Configuration(format!("embedding client: {}", e)))?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    async fn request(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequest {
            model: &self.config.model,
            input,
        };

        let mut req = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let response = req
            .send()
            .await
            .map_err(|e| ContextError::Embedding(format!("network error: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ContextError::Embedding(format!("HTTP {}: {}", status, body)));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ContextError::Embedding(format!("failed to parse response: {}", e)))?;

        if parsed.data.len() != input.len() {
            return Err(ContextError::Embedding(format!(
                "expected {} embeddings, got {}",
                input.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn name(&self) -> &str {
        &self.config.model
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(ContextError::Embedding("text cannot be empty".to_string()));
        }
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ContextError::Embedding("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(ContextError::Embedding("text cannot be empty".to_string()));
        }
        debug!("Embedding batch of {} texts via {}", texts.len(), self.config.model);
        self.request(texts).await
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}
