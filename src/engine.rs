//! Engine facade wiring chunker, index, memory, router and synthesizer
//! into one handle

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

use crate::chunking::{Chunker, Document};
use crate::config::Config;
use crate::context::{
    estimator_from_name, ConcatenationSummarizer, ModelSummarizer, Summarizer, TokenBudgetManager,
};
use crate::error::{ContextError, Result};
use crate::facts::{FactExtractor, ModelExtractor, PatternExtractor};
use crate::index::{embedder_from_config, EmbeddingIndex};
use crate::memory::{CommitReport, ContextMemory, SessionScope};
use crate::metrics::METRICS;
use crate::router::{ModelBackend, ModelRouter, TaskDescriptor, TaskType};
use crate::synthesis::{ContentBlock, ContentRequest, EscalationHandler, SynthesisFailure, Synthesizer};

/// Outcome of one document in a batch ingestion
#[derive(Debug)]
pub struct DocumentOutcome {
    pub document_id: String,
    pub result: Result<usize>,
}

/// Per-document results of a batch ingestion
#[derive(Debug, Default)]
pub struct IngestReport {
    pub outcomes: Vec<DocumentOutcome>,
}

impl IngestReport {
    pub fn chunks_indexed(&self) -> usize {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .sum()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ContextError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.document_id.as_str(), e)))
    }
}

/// Context-aware retrieval and synthesis engine
pub struct ContextEngine {
    config: Config,
    chunker: Chunker,
    index: Arc<EmbeddingIndex>,
    memory: Arc<ContextMemory>,
    router: Arc<ModelRouter>,
    synthesizer: Synthesizer,
}

impl ContextEngine {
    /// Build every component from configuration.
    ///
    /// The index is restored from its snapshot when one exists.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let embedder = embedder_from_config(&config.index.embedder)?;
        let index = match &config.index.snapshot_path {
            Some(path) if tokio::fs::try_exists(path).await? => {
                EmbeddingIndex::load_snapshot(path, config.index.clone(), embedder).await?
            }
            _ => EmbeddingIndex::new(config.index.clone(), embedder),
        };
        let router = Arc::new(ModelRouter::from_config(&config.router)?);

        let summarizer: Arc<dyn Summarizer> = match config.memory.summarizer.as_str() {
            "model" => Arc::new(ModelSummarizer::new(helper_backend(&router)?)),
            _ => Arc::new(ConcatenationSummarizer::new(estimator_from_name(
                &config.chunking.estimator,
            )?)),
        };
        let memory = ContextMemory::with_summarizer(config.memory.clone(), summarizer).await?;

        let extractor: Arc<dyn FactExtractor> = match config.facts.extractor.as_str() {
            "model" => Arc::new(ModelExtractor::new(
                helper_backend(&router)?,
                config.facts.clone(),
            )?),
            _ => Arc::new(PatternExtractor::new(config.facts.clone())?),
        };

        Self::assemble(config, Arc::new(index), Arc::new(memory), router, extractor)
    }

    /// Build around caller-supplied components; `config` supplies the rest
    pub fn assemble(
        config: Config,
        index: Arc<EmbeddingIndex>,
        memory: Arc<ContextMemory>,
        router: Arc<ModelRouter>,
        extractor: Arc<dyn FactExtractor>,
    ) -> Result<Self> {
        let chunker = Chunker::from_config(config.chunking.clone())?;
        let budget = TokenBudgetManager::new(
            config.token_budget.clone(),
            estimator_from_name(&config.chunking.estimator)?,
        )?;
        let synthesizer = Synthesizer::new(index.clone(), memory.clone(), router.clone(), extractor)?
            .with_contradiction_config(&config.contradiction)?
            .with_budget(budget)
            .with_retry(config.retry.clone())
            .with_config(config.synthesis.clone());

        info!(
            "Engine ready: {} model profiles, {:?} fusion",
            router.registry().len(),
            config.index.fusion
        );
        Ok(Self {
            config,
            chunker,
            index,
            memory,
            router,
            synthesizer,
        })
    }

    /// Route unresolved contradictions to `handler` instead of failing
    pub fn with_escalation(mut self, handler: Arc<dyn EscalationHandler>) -> Self {
        self.synthesizer = self.synthesizer.with_escalation(handler);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Arc<EmbeddingIndex> {
        &self.index
    }

    pub fn memory(&self) -> &Arc<ContextMemory> {
        &self.memory
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    /// Chunk and index one document; returns the number of chunks
    pub async fn ingest(&self, doc: Document) -> Result<usize> {
        let document_id = doc.id.clone();
        let result = match self.chunker.chunk(&doc) {
            Ok(chunks) => self.index.index_batch(chunks).await,
            Err(e) => Err(e),
        };
        METRICS.record_ingestion(result.is_ok());
        if let Err(e) = &result {
            warn!("Ingestion of {} failed: {}", document_id, e);
        }
        result
    }

    /// Ingest documents concurrently. A failing document is reported and
    /// the rest continue.
    pub async fn ingest_all(&self, docs: Vec<Document>) -> IngestReport {
        let concurrency = self.config.chunking.concurrency.max(1);
        let chunked = self.chunker.chunk_all(docs).await;
        let outcomes: Vec<DocumentOutcome> = stream::iter(chunked)
            .map(|outcome| async move {
                let result = match outcome.result {
                    Ok(chunks) => self.index.index_batch(chunks).await,
                    Err(e) => Err(e),
                };
                METRICS.record_ingestion(result.is_ok());
                DocumentOutcome {
                    document_id: outcome.document_id,
                    result,
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let report = IngestReport { outcomes };
        info!(
            "Ingested {}/{} documents, {} chunks",
            report.succeeded(),
            report.outcomes.len(),
            report.chunks_indexed()
        );
        report
    }

    pub async fn start_session(&self, session_id: Option<String>) -> Result<String> {
        let session = self.memory.start_session(session_id).await?;
        Ok(session.id().to_string())
    }

    /// Rebuild a session from its audit log
    pub async fn restore_session(&self, session_id: &str) -> Result<String> {
        let session = self.memory.restore_session(session_id).await?;
        Ok(session.id().to_string())
    }

    pub async fn session_scope(&self, session_id: &str) -> Result<SessionScope> {
        self.memory.get_scope(session_id).await
    }

    /// Abort in-flight requests; the session keeps its last emitted state
    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        self.memory.cancel_session(session_id).await
    }

    /// Close the session, optionally committing its accepted facts to
    /// long-term memory
    pub async fn end_session(&self, session_id: &str, commit: bool) -> Result<Option<CommitReport>> {
        self.memory.end_session(session_id, commit).await
    }

    pub async fn generate_block(&self, request: ContentRequest) -> std::result::Result<ContentBlock, SynthesisFailure> {
        self.synthesizer.generate(request).await
    }

    /// Write the index snapshot when a path is configured
    pub async fn save_index(&self) -> Result<()> {
        match &self.config.index.snapshot_path {
            Some(path) => self.index.save_snapshot(path).await,
            None => Ok(()),
        }
    }

    /// Prometheus text exposition of engine metrics
    pub fn metrics_text(&self) -> Result<String> {
        METRICS.export()
    }
}

/// Backend for auxiliary model work (extraction, summaries)
fn helper_backend(router: &ModelRouter) -> Result<Arc<dyn ModelBackend>> {
    let decision = router.route(&TaskDescriptor::new(TaskType::Qa))?;
    router
        .registry()
        .backend_for(&decision.profile.name)
        .ok_or_else(|| {
            ContextError::Configuration(format!(
                "profile {} has no backend",
                decision.profile.name
            ))
        })
}
