//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use deck_context::error::{ContextError, Result};
use deck_context::facts::PatternExtractor;
use deck_context::index::{Embedder, EmbeddingIndex, HashingEmbedder, IndexConfig};
use deck_context::memory::{ContextMemory, MemoryConfig};
use deck_context::router::{
    CostClass, LatencyClass, ModelBackend, ModelProfile, ModelRegistry, ModelRequest,
    ModelResponse, ModelRouter, RouterConfig, TaskType,
};
use deck_context::{Config, ContextEngine};

/// What the scripted backend does on its next call
pub enum Step {
    Reply(String),
    /// Signal `started`, then never answer
    Hang,
    Fail(String),
}

/// Backend answering from a queue; repeats the last reply when drained
pub struct ScriptedBackend {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<String>>,
    pub started: Notify,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(name: &str, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            started: Notify::new(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn replying(name: &str, text: &str) -> Arc<Self> {
        Self::new(name, vec![Step::Reply(text.to_string())])
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let step = self.steps.lock().unwrap().pop_front();
        let text = match step {
            Some(Step::Reply(text)) => {
                *self.last.lock().unwrap() = Some(text.clone());
                text
            }
            Some(Step::Hang) => {
                self.started.notify_one();
                tokio::time::sleep(Duration::from_secs(300)).await;
                return Err(ContextError::ModelInvocation("hung".to_string()));
            }
            Some(Step::Fail(reason)) => return Err(ContextError::ModelInvocation(reason)),
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_default(),
        };
        Ok(ModelResponse {
            text,
            model: self.name.clone(),
            prompt_tokens: None,
            completion_tokens: None,
        })
    }
}

/// One dimension per vocabulary word; anything else embeds to zero
pub struct KeywordEmbedder {
    vocabulary: Vec<&'static str>,
}

impl KeywordEmbedder {
    pub fn new(vocabulary: Vec<&'static str>) -> Self {
        Self { vocabulary }
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn name(&self) -> &str {
        "keyword"
    }

    fn dimensions(&self) -> usize {
        self.vocabulary.len()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lower = text.to_lowercase();
        Ok(self
            .vocabulary
            .iter()
            .map(|word| lower.matches(word).count() as f32)
            .collect())
    }
}

/// Single general-purpose profile backed by `backend`
pub fn router_with(backend: Arc<dyn ModelBackend>) -> Arc<ModelRouter> {
    let registry = ModelRegistry::new()
        .with(
            ModelProfile::new("writer", &[TaskType::Outline, TaskType::Qa])
                .with_capabilities(&["tables"])
                .with_latency(LatencyClass::Fast, 1_000)
                .with_cost(CostClass::Low, 0.5),
            backend,
        )
        .unwrap();
    Arc::new(ModelRouter::new(registry, &RouterConfig::default()))
}

/// Test configuration: no retries, memory rooted in `dir`
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.memory = MemoryConfig::rooted_at(dir);
    config.retry.max_attempts = 1;
    config
}

pub async fn engine_with(
    dir: &Path,
    embedder: Arc<dyn Embedder>,
    backend: Arc<dyn ModelBackend>,
) -> ContextEngine {
    let config = test_config(dir);
    let index = Arc::new(EmbeddingIndex::new(IndexConfig::default(), embedder));
    let memory = Arc::new(ContextMemory::open(config.memory.clone()).await.unwrap());
    let extractor = Arc::new(PatternExtractor::new(config.facts.clone()).unwrap());
    ContextEngine::assemble(config, index, memory, router_with(backend), extractor).unwrap()
}

pub async fn engine(dir: &Path, backend: Arc<dyn ModelBackend>) -> ContextEngine {
    engine_with(dir, Arc::new(HashingEmbedder::new(384)), backend).await
}
