//! Metrics collection for observability

use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry, register_histogram_with_registry, Counter, CounterVec,
    Histogram, HistogramVec, Opts, Registry,
};
use std::sync::Arc;
use once_cell::sync::Lazy;

use crate::error::{ContextError, Result};
use crate::index::SearchMode;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Ingestion
    pub documents_ingested: CounterVec,
    pub chunks_indexed: Counter,

    // Retrieval
    pub retrieval_requests: CounterVec,
    pub retrieval_duration: HistogramVec,
    pub retrieval_misses: Counter,
    pub query_expansions: Counter,

    // Facts and contradictions
    pub facts_extracted: CounterVec,
    pub contradictions_detected: Counter,
    pub contradictions_resolved: CounterVec,

    // Routing
    pub routing_decisions: CounterVec,
    pub routing_relaxations: CounterVec,
    pub model_latency: HistogramVec,

    // Synthesis
    pub synthesis_outcomes: CounterVec,
    pub synthesis_retries: CounterVec,

    // Token budget
    pub token_budget_used: Histogram,
    pub token_budget_overflows: Counter,

    // Memory
    pub memory_commits: Counter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> std::result::Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let documents_ingested = register_counter_vec_with_registry!(
            Opts::new("documents_ingested_total", "Documents submitted for ingestion"),
            &["status"],
            registry
        )?;

        let chunks_indexed = register_counter_with_registry!(
            Opts::new("chunks_indexed_total", "Chunks added to the embedding index"),
            registry
        )?;

        let retrieval_requests = register_counter_vec_with_registry!(
            Opts::new("retrieval_requests_total", "Index searches"),
            &["mode"],
            registry
        )?;

        let retrieval_duration = register_histogram_vec_with_registry!(
            "retrieval_duration_seconds",
            "Index search duration in seconds",
            &["mode"],
            registry
        )?;

        let retrieval_misses = register_counter_with_registry!(
            Opts::new("retrieval_misses_total", "Requests that failed with a retrieval miss"),
            registry
        )?;

        let query_expansions = register_counter_with_registry!(
            Opts::new("query_expansions_total", "Queries re-issued with expansion"),
            registry
        )?;

        let facts_extracted = register_counter_vec_with_registry!(
            Opts::new("facts_extracted_total", "Facts produced by extractors"),
            &["extractor"],
            registry
        )?;

        let contradictions_detected = register_counter_with_registry!(
            Opts::new("contradictions_detected_total", "New contradiction records"),
            registry
        )?;

        let contradictions_resolved = register_counter_vec_with_registry!(
            Opts::new("contradictions_resolved_total", "Contradictions resolved, by rule"),
            &["rule"],
            registry
        )?;

        let routing_decisions = register_counter_vec_with_registry!(
            Opts::new("routing_decisions_total", "Routing decisions, by selected profile"),
            &["profile"],
            registry
        )?;

        let routing_relaxations = register_counter_vec_with_registry!(
            Opts::new("routing_relaxations_total", "Constraints relaxed during routing"),
            &["relaxation"],
            registry
        )?;

        let model_latency = register_histogram_vec_with_registry!(
            "model_latency_seconds",
            "Model invocation latency in seconds",
            &["profile"],
            registry
        )?;

        let synthesis_outcomes = register_counter_vec_with_registry!(
            Opts::new("synthesis_outcomes_total", "Synthesis requests by final stage and outcome"),
            &["stage", "outcome"],
            registry
        )?;

        let synthesis_retries = register_counter_vec_with_registry!(
            Opts::new("synthesis_retries_total", "Retry attempts, by stage"),
            &["stage"],
            registry
        )?;

        let token_budget_used = register_histogram_with_registry!(
            "token_budget_used",
            "Tokens placed in the model context window per request",
            registry
        )?;

        let token_budget_overflows = register_counter_with_registry!(
            Opts::new("token_budget_overflows_total", "Facts left out of a full context window"),
            registry
        )?;

        let memory_commits = register_counter_with_registry!(
            Opts::new("memory_commits_total", "Session commits to long-term memory"),
            registry
        )?;

        Ok(Self {
            registry,
            documents_ingested,
            chunks_indexed,
            retrieval_requests,
            retrieval_duration,
            retrieval_misses,
            query_expansions,
            facts_extracted,
            contradictions_detected,
            contradictions_resolved,
            routing_decisions,
            routing_relaxations,
            model_latency,
            synthesis_outcomes,
            synthesis_retries,
            token_budget_used,
            token_budget_overflows,
            memory_commits,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_ingestion(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.documents_ingested.with_label_values(&[status]).inc();
    }

    /// Record one index search
    pub fn record_retrieval(&self, mode: SearchMode, seconds: f64) {
        let label = mode.to_string();
        self.retrieval_requests.with_label_values(&[label.as_str()]).inc();
        self.retrieval_duration
            .with_label_values(&[label.as_str()])
            .observe(seconds);
    }

    pub fn record_model_call(&self, profile: &str, seconds: f64) {
        self.model_latency.with_label_values(&[profile]).observe(seconds);
    }

    pub fn record_synthesis(&self, stage: &str, outcome: &str) {
        self.synthesis_outcomes
            .with_label_values(&[stage, outcome])
            .inc();
    }

    /// Record token budget usage
    pub fn record_token_budget(&self, used: usize, overflow: bool) {
        self.token_budget_used.observe(used as f64);
        if overflow {
            self.token_budget_overflows.inc();
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| ContextError::Internal(format!("metrics encoding: {}", e)))?;

        String::from_utf8(buffer).map_err(|e| ContextError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let metrics = Metrics::new();
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_export_contains_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_retrieval(SearchMode::Hybrid, 0.01);
        metrics.record_synthesis("emitted", "success");
        metrics.record_token_budget(8100, true);

        let text = metrics.export().unwrap();
        assert!(text.contains("retrieval_requests_total{mode=\"hybrid\"} 1"));
        assert!(text.contains("synthesis_outcomes_total"));
        assert!(text.contains("token_budget_overflows_total 1"));
    }
}
