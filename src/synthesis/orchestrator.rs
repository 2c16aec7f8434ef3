//! Retrieval-augmented synthesis of one content block per request
//!
//! Each request walks `QueryFormed → Retrieved → FactsChecked →
//! ContradictionsResolved → ModelInvoked → Validated → Emitted`. Work is
//! staged in a private [`MemoryBatch`] and applied to the session only at
//! Emitted, so a failed or cancelled request leaves memory untouched.

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::escalation::EscalationHandler;
use super::grounding::GroundingChecker;
use super::models::{Citation, ContentBlock, ContentRequest, SynthesisFailure, SynthesisStage};
use super::retry::RetryPolicy;
use super::window::FactWindow;
use crate::chunking::Chunk;
use crate::context::TokenBudgetManager;
use crate::contradiction::{ContradictionConfig, ContradictionDetector, ContradictionRecord};
use crate::error::{ContextError, Result};
use crate::facts::{Fact, FactExtractor};
use crate::index::{tokenize, EmbeddingIndex, QueryExpander, RetrievalQuery, SearchHit};
use crate::memory::{
    CancelSignal, ContextMemory, GenerationStep, MemoryBatch, MemoryEvent, RetrievalRecord,
    SessionScope,
};
use crate::metrics::METRICS;
use crate::router::{ModelRequest, ModelResponse, ModelRouter, RoutingDecision};

const DEFAULT_SYSTEM_PROMPT: &str = "You write presentation slide content from the supplied facts only. \
Cite every fact you use with its marker, for example [F1]. \
Do not state any claim or number that is not among the facts.";

/// Synthesizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Fewer hits than this triggers one expansion, then a retrieval miss
    #[serde(default = "default_min_results")]
    pub min_results: usize,

    /// Running-summary terms appended to the topic when forming the query
    #[serde(default = "default_summary_terms")]
    pub summary_terms: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Fold each emitted block into the running summary
    #[serde(default = "default_update_summary")]
    pub update_summary: bool,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_top_k() -> usize {
    8
}

fn default_min_results() -> usize {
    1
}

fn default_summary_terms() -> usize {
    6
}

fn default_temperature() -> f32 {
    0.2
}

fn default_update_summary() -> bool {
    true
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_results: default_min_results(),
            summary_terms: default_summary_terms(),
            temperature: default_temperature(),
            update_summary: default_update_summary(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl SynthesisConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.top_k == 0 {
            return Err("synthesis.top_k must be positive".to_string());
        }
        if self.min_results > self.top_k {
            return Err(format!(
                "synthesis.min_results ({}) exceeds top_k ({})",
                self.min_results, self.top_k
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err("synthesis.temperature must be within [0, 2]".to_string());
        }
        Ok(())
    }
}

/// Stage and attempt count of an in-flight request
struct Progress {
    stage: SynthesisStage,
    attempts: u32,
}

impl Progress {
    fn enter(&mut self, stage: SynthesisStage, request_id: &str) {
        debug!("Request {} entering {}", request_id, stage);
        self.stage = stage;
        self.attempts = 1;
    }
}

struct Retrieval {
    hits: Vec<SearchHit>,
    query: String,
    expanded: bool,
}

struct Invocation {
    decision: RoutingDecision,
    window: FactWindow,
    response: ModelResponse,
}

/// Resolves when `cancel` fires, otherwise yields `fut`'s result
async fn until_cancelled<T>(
    cancel: &mut CancelSignal,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    let session_id = cancel.session_id().to_string();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ContextError::Cancelled(session_id)),
        result = fut => result,
    }
}

/// Orchestrates index, memory, extraction, contradiction handling and
/// model routing for content-block requests
pub struct Synthesizer {
    index: Arc<EmbeddingIndex>,
    memory: Arc<ContextMemory>,
    router: Arc<ModelRouter>,
    extractor: Arc<dyn FactExtractor>,
    detector: ContradictionDetector,
    grounding: GroundingChecker,
    budget: TokenBudgetManager,
    expander: QueryExpander,
    retry: RetryPolicy,
    config: SynthesisConfig,
    escalation: Option<Arc<dyn EscalationHandler>>,
}

impl Synthesizer {
    pub fn new(
        index: Arc<EmbeddingIndex>,
        memory: Arc<ContextMemory>,
        router: Arc<ModelRouter>,
        extractor: Arc<dyn FactExtractor>,
    ) -> Result<Self> {
        let contradiction = ContradictionConfig::default();
        Ok(Self {
            index,
            memory,
            router,
            extractor,
            detector: ContradictionDetector::new(&contradiction),
            grounding: GroundingChecker::new(contradiction.tolerance)?,
            budget: TokenBudgetManager::with_defaults()?,
            expander: QueryExpander::default(),
            retry: RetryPolicy::default(),
            config: SynthesisConfig::default(),
            escalation: None,
        })
    }

    /// Tolerances and resolution rules for both detection and grounding
    pub fn with_contradiction_config(mut self, config: &ContradictionConfig) -> Result<Self> {
        self.detector = ContradictionDetector::new(config);
        self.grounding = GroundingChecker::new(config.tolerance.clone())?;
        Ok(self)
    }

    pub fn with_budget(mut self, budget: TokenBudgetManager) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_expander(mut self, expander: QueryExpander) -> Self {
        self.expander = expander;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: SynthesisConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_escalation(mut self, handler: Arc<dyn EscalationHandler>) -> Self {
        self.escalation = Some(handler);
        self
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Run one request to Emitted or Failed.
    ///
    /// Cancelling the session aborts the request at its next suspension
    /// point; nothing it staged is applied.
    pub async fn generate(&self, request: ContentRequest) -> std::result::Result<ContentBlock, SynthesisFailure> {
        let mut progress = Progress {
            stage: SynthesisStage::QueryFormed,
            attempts: 1,
        };

        match self.run(&request, &mut progress).await {
            Ok(block) => {
                METRICS.record_synthesis(SynthesisStage::Emitted.as_str(), "success");
                info!(
                    "Emitted block for request {} in session {} via {} citing {} chunks",
                    request.request_id,
                    request.session_id,
                    block.model,
                    block.citations.len()
                );
                Ok(block)
            }
            Err(error) => {
                let outcome = if matches!(error, ContextError::Cancelled(_)) {
                    "cancelled"
                } else {
                    "failed"
                };
                METRICS.record_synthesis(progress.stage.as_str(), outcome);
                warn!(
                    "Request {} in session {} failed at {}: {}",
                    request.request_id, request.session_id, progress.stage, error
                );
                let failed = MemoryEvent::RequestFailed {
                    request_id: request.request_id.clone(),
                    stage: progress.stage.to_string(),
                    error: error.to_string(),
                };
                if let Err(e) = self.memory.log_event(&request.session_id, failed).await {
                    debug!("Could not log failure of {}: {}", request.request_id, e);
                }
                Err(SynthesisFailure::new(progress.stage, &request, progress.attempts, error))
            }
        }
    }

    async fn run(&self, request: &ContentRequest, progress: &mut Progress) -> Result<ContentBlock> {
        let session = self.memory.session(&request.session_id)?;
        session.ensure_writable()?;
        let mut cancel = session.cancel_signal();

        // QueryFormed
        let scope = session.scope().await;
        let query = query_with_summary(&request.topic, &scope.summary, self.config.summary_terms);

        // Retrieved
        progress.enter(SynthesisStage::Retrieved, &request.request_id);
        let retrieval = loop {
            let attempt = self.retrieve(request, &query);
            match until_cancelled(&mut cancel, attempt).await {
                Ok(retrieval) => break retrieval,
                Err(e) => self.retry_or_fail(request, progress, e, &mut cancel).await?,
            }
        };

        // FactsChecked
        progress.enter(SynthesisStage::FactsChecked, &request.request_id);
        let new_chunks: Vec<&Chunk> = retrieval
            .hits
            .iter()
            .map(|h| &h.chunk)
            .filter(|c| !scope.knows_chunk(&c.id))
            .collect();
        let new_facts = until_cancelled(&mut cancel, self.extract(&new_chunks)).await?;
        let recalled = self.memory.recall(&request.session_id, &request.topic).await?;
        let pool = build_pool(&scope, &retrieval.hits, &new_facts, recalled.facts);

        // ContradictionsResolved
        progress.enter(SynthesisStage::ContradictionsResolved, &request.request_id);
        let records = until_cancelled(&mut cancel, self.resolve_contradictions(&scope, &pool)).await?;
        let losers: HashSet<String> = records
            .iter()
            .filter_map(|r| r.loser().map(str::to_string))
            .collect();
        let usable: Vec<Fact> = pool
            .values()
            .filter(|f| !losers.contains(&f.id))
            .cloned()
            .collect();

        // ModelInvoked
        progress.enter(SynthesisStage::ModelInvoked, &request.request_id);
        let invocation = loop {
            let attempt = self.invoke(request, &scope.summary, &usable);
            match until_cancelled(&mut cancel, attempt).await {
                Ok(invocation) => break invocation,
                Err(e) => self.retry_or_fail(request, progress, e, &mut cancel).await?,
            }
        };
        let model_attempts = progress.attempts;

        // Validated
        progress.enter(SynthesisStage::Validated, &request.request_id);
        let used = self
            .grounding
            .check(&invocation.response.text, &invocation.window, &request.topic)
            .into_result()?;

        // Emitted
        progress.enter(SynthesisStage::Emitted, &request.request_id);
        cancel.check()?;
        let block = build_block(request, &invocation, &used, &records, model_attempts);

        let mut batch = MemoryBatch::new(request.request_id.clone());
        let new_ids: HashSet<&str> = new_facts.iter().map(|f| f.id.as_str()).collect();
        for fact in pool.values() {
            let needed = new_ids.contains(fact.id.as_str())
                || losers.contains(&fact.id)
                || used.contains(&fact.id);
            if needed && !scope.accepted.contains_key(&fact.id) && !scope.is_superseded(&fact.id) {
                batch.record_fact(fact.clone());
            }
        }
        for record in &records {
            batch.record_contradiction(record.clone());
        }
        for record in &records {
            if let Some(loser) = record.loser() {
                batch.supersede(loser, record.id.clone());
            }
        }
        batch.record_retrieval(RetrievalRecord {
            request_id: request.request_id.clone(),
            query: retrieval.query.clone(),
            chunk_ids: retrieval.hits.iter().map(|h| h.chunk.id.clone()).collect(),
            expanded: retrieval.expanded,
            at: Utc::now(),
        });
        batch.mark_chunks_seen(new_chunks.iter().map(|c| c.id.clone()).collect());
        if self.config.update_summary {
            let summary = self
                .memory
                .summarize(&scope.summary, &[block.text.clone()])
                .await?;
            batch.update_summary(summary);
        }
        batch.record_step(GenerationStep {
            request_id: request.request_id.clone(),
            topic: request.topic.clone(),
            model: block.model.clone(),
            citations: block.citations.clone(),
            fact_ids: used.clone(),
            at: Utc::now(),
        });

        // the session lock rejects the batch if cancellation won the race
        self.memory.apply_batch(&request.session_id, batch).await?;
        Ok(block)
    }

    async fn retrieve(&self, request: &ContentRequest, query: &str) -> Result<Retrieval> {
        let top_k = request.top_k.unwrap_or(self.config.top_k);
        let search = |text: String| {
            RetrievalQuery::new(text, top_k)
                .with_mode(request.mode)
                .for_session(request.session_id.clone())
        };

        let hits = self.index.search(&search(query.to_string())).await?;
        if hits.len() >= self.config.min_results {
            return Ok(Retrieval {
                hits,
                query: query.to_string(),
                expanded: false,
            });
        }

        // one expansion: synonyms of the topic, summary terms dropped
        let expanded = self
            .expander
            .expand(&request.topic)
            .unwrap_or_else(|| request.topic.clone());
        METRICS.query_expansions.inc();
        debug!(
            "Expanding '{}' to '{}' after {} hits",
            query,
            expanded,
            hits.len()
        );
        let hits = self.index.search(&search(expanded.clone())).await?;
        if hits.len() < self.config.min_results {
            METRICS.retrieval_misses.inc();
            return Err(ContextError::RetrievalMiss {
                query: request.topic.clone(),
                found: hits.len(),
                required: self.config.min_results,
            });
        }
        Ok(Retrieval {
            hits,
            query: expanded,
            expanded: true,
        })
    }

    async fn extract(&self, chunks: &[&Chunk]) -> Result<Vec<Fact>> {
        let mut facts = Vec::new();
        for chunk in chunks {
            facts.extend(self.extractor.extract(chunk).await?);
        }
        METRICS
            .facts_extracted
            .with_label_values(&[self.extractor.version()])
            .inc_by(facts.len() as f64);
        Ok(facts)
    }

    /// New records plus open ones already in the session that touch the
    /// pool, all decided by policy or escalation
    async fn resolve_contradictions(
        &self,
        scope: &SessionScope,
        pool: &IndexMap<String, Fact>,
    ) -> Result<Vec<ContradictionRecord>> {
        let facts: Vec<Fact> = pool.values().cloned().collect();
        let outcome = self.detector.detect_and_resolve(&facts, &scope.known_pairs())?;
        let mut records = outcome.records;

        let carried_from = records.len();
        records.extend(
            scope
                .open_contradictions()
                .filter(|r| pool.contains_key(&r.fact_a) || pool.contains_key(&r.fact_b))
                .cloned(),
        );

        let mut by_id: HashMap<String, Fact> = scope
            .accepted
            .iter()
            .map(|(id, f)| (id.clone(), f.clone()))
            .collect();
        by_id.extend(pool.iter().map(|(id, f)| (id.clone(), f.clone())));
        self.detector
            .resolve_all(&mut records[carried_from..], &by_id)?;

        for record in records.iter_mut().filter(|r| r.is_open()) {
            if let (Some(handler), Some(a), Some(b)) = (
                self.escalation.as_ref(),
                by_id.get(&record.fact_a),
                by_id.get(&record.fact_b),
            ) {
                if let Some(resolution) = handler.escalate(record, a, b).await? {
                    METRICS
                        .contradictions_resolved
                        .with_label_values(&[resolution.rule.to_string().as_str()])
                        .inc();
                    record.resolve(resolution)?;
                    continue;
                }
            }
            return Err(ContextError::ContradictionUnresolved {
                record_id: record.id.clone(),
                entity: record.entity.clone(),
                predicate: record.predicate.clone(),
            });
        }
        Ok(records)
    }

    async fn invoke(&self, request: &ContentRequest, summary: &str, facts: &[Fact]) -> Result<Invocation> {
        let decision = self.router.route(&request.task)?;

        let header = format!("Topic: {}\n", request.topic);
        let instructions_used = self.budget.estimate_tokens(&self.config.system_prompt)
            + self.budget.estimate_tokens(&header);
        let summary = self.fit_summary(summary);
        let summary_used = self.budget.estimate_tokens(&summary);
        let facts_budget = self.budget.facts_budget(
            decision.profile.context_window,
            instructions_used,
            summary_used,
        )?;

        let window = FactWindow::assemble(facts.to_vec(), facts_budget, &self.budget);
        if window.is_empty() {
            warn!("No eligible facts for request {}", request.request_id);
            return Err(ContextError::GroundingViolation {
                claims: vec![format!("no supplied fact fits the window for '{}'", request.topic)],
            });
        }
        let allocation = self.budget.allocate(
            decision.profile.context_window,
            instructions_used,
            summary_used,
            window.tokens_used(),
        )?;
        debug!(
            "Prompt for {} allocates {} tokens, {} spare",
            request.request_id, allocation.total_allocated, allocation.remaining
        );
        METRICS.record_token_budget(allocation.total_allocated, window.dropped() > 0);

        let mut prompt = header;
        if !summary.is_empty() {
            prompt.push_str("\nRunning summary:\n");
            prompt.push_str(&summary);
            prompt.push('\n');
        }
        prompt.push_str("\nFacts:\n");
        prompt.push_str(&window.render());
        prompt.push_str("\nWrite the slide content for this topic.");

        let model_request = ModelRequest {
            system: self.config.system_prompt.clone(),
            prompt,
            max_tokens: self.budget.config().completion,
            temperature: self.config.temperature,
        };
        let response = self
            .router
            .invoke(&decision, &model_request, request.task.max_latency())
            .await?;

        Ok(Invocation {
            decision,
            window,
            response,
        })
    }

    /// Trailing words are dropped until the summary fits its allotment
    fn fit_summary(&self, summary: &str) -> String {
        let limit = self.budget.config().running_summary;
        if self.budget.estimate_tokens(summary) <= limit {
            return summary.to_string();
        }
        let mut words: Vec<&str> = summary.split_whitespace().collect();
        while !words.is_empty() && self.budget.estimate_tokens(&words.join(" ")) > limit {
            let keep = words.len() * 9 / 10;
            words.truncate(keep);
        }
        words.join(" ")
    }

    /// Back off and return `Ok` when the failed stage may run again,
    /// otherwise hand the error back
    async fn retry_or_fail(
        &self,
        request: &ContentRequest,
        progress: &mut Progress,
        error: ContextError,
        cancel: &mut CancelSignal,
    ) -> Result<()> {
        if !progress.stage.is_retryable() || !self.retry.should_retry(progress.attempts, &error) {
            return Err(error);
        }

        let delay = self.retry.backoff(progress.attempts);
        warn!(
            "Request {} {} attempt {} failed: {}, retrying in {:?}",
            request.request_id, progress.stage, progress.attempts, error, delay
        );
        METRICS
            .synthesis_retries
            .with_label_values(&[progress.stage.as_str()])
            .inc();
        self.memory
            .log_event(
                &request.session_id,
                MemoryEvent::RetryAttempted {
                    request_id: request.request_id.clone(),
                    stage: progress.stage.to_string(),
                    attempt: progress.attempts,
                    error: error.to_string(),
                },
            )
            .await?;

        until_cancelled(cancel, async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await?;
        progress.attempts += 1;
        Ok(())
    }
}

/// Topic plus the most frequent running-summary terms not already in it
fn query_with_summary(topic: &str, summary: &str, terms: usize) -> String {
    if terms == 0 || summary.trim().is_empty() {
        return topic.to_string();
    }
    let topic_terms: HashSet<String> = tokenize(topic).into_iter().collect();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for term in tokenize(summary) {
        if term.len() > 2 && !topic_terms.contains(&term) && !term.chars().all(|c| c.is_ascii_digit()) {
            *counts.entry(term).or_default() += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut query = topic.to_string();
    for (term, _) in ranked.into_iter().take(terms) {
        query.push(' ');
        query.push_str(&term);
    }
    query
}

/// Facts the request may use: new facts, accepted facts from the hits or
/// sharing a key with a new fact, and recalled facts. Superseded facts
/// never enter.
fn build_pool(
    scope: &SessionScope,
    hits: &[SearchHit],
    new_facts: &[Fact],
    recalled: Vec<Fact>,
) -> IndexMap<String, Fact> {
    let hit_chunks: HashSet<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
    let new_keys: HashSet<(&str, &str)> = new_facts.iter().map(|f| f.key()).collect();

    let mut pool = IndexMap::new();
    let mut add = |fact: Fact| {
        if !scope.is_superseded(&fact.id) && !pool.contains_key(&fact.id) {
            pool.insert(fact.id.clone(), fact);
        }
    };

    for fact in new_facts {
        add(fact.clone());
    }
    for fact in scope.accepted.values() {
        let from_hit = fact
            .supporting
            .iter()
            .any(|c| hit_chunks.contains(c.chunk_id.as_str()));
        if from_hit || new_keys.contains(&fact.key()) {
            add(fact.clone());
        }
    }
    for fact in recalled {
        add(fact);
    }
    pool
}

fn build_block(
    request: &ContentRequest,
    invocation: &Invocation,
    used: &[String],
    records: &[ContradictionRecord],
    attempts: u32,
) -> ContentBlock {
    let mut citations: Vec<String> = Vec::new();
    let mut sources = Vec::new();
    let mut facts = Vec::new();

    for fact_id in used {
        let Some(entry) = invocation.window.entries().iter().find(|e| &e.fact.id == fact_id) else {
            continue;
        };
        for chunk in &entry.fact.supporting {
            if !citations.contains(&chunk.chunk_id) {
                citations.push(chunk.chunk_id.clone());
            }
        }
        if let Some(chunk) = entry.fact.primary_chunk() {
            sources.push(Citation {
                marker: entry.marker.clone(),
                fact_id: entry.fact.id.clone(),
                chunk_id: chunk.chunk_id.clone(),
                document_id: chunk.document_id.clone(),
            });
        }
        facts.push(entry.fact.clone());
    }

    ContentBlock {
        request_id: request.request_id.clone(),
        session_id: request.session_id.clone(),
        topic: request.topic.clone(),
        text: invocation.response.text.clone(),
        citations,
        sources,
        facts,
        resolutions: records.to_vec(),
        model: invocation.decision.profile.name.clone(),
        relaxations: invocation.decision.relaxations.clone(),
        attempts,
    }
}
