//! Error taxonomy for the retrieval and synthesis engine

use std::time::Duration;
use thiserror::Error;

use crate::context::{BudgetError, SummarizerError};

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ContextError>;

/// Engine errors
#[derive(Debug, Error)]
pub enum ContextError {
    /// Malformed or empty document. Reported per document; other documents continue.
    #[error("Ingestion failed for document {doc_id}: {reason}")]
    Ingestion { doc_id: String, reason: String },

    /// No chunk met the relevance threshold, even after one query expansion
    #[error("Retrieval miss for '{query}': {found} results, {required} required")]
    RetrievalMiss {
        query: String,
        found: usize,
        required: usize,
    },

    /// Resolution policy exhausted and nothing else resolved the record
    #[error("Unresolved contradiction {record_id} on ({entity}, {predicate})")]
    ContradictionUnresolved {
        record_id: String,
        entity: String,
        predicate: String,
    },

    #[error("Model {model} timed out after {timeout:?}")]
    ModelTimeout { model: String, timeout: Duration },

    #[error("No eligible model for task {task}: {reason}")]
    NoEligibleModel { task: String, reason: String },

    #[error("Model invocation failed: {0}")]
    ModelInvocation(String),

    /// Model output asserted claims absent from the supplied context
    #[error("Grounding violation: {} ungrounded claim(s): {}", claims.len(), claims.join("; "))]
    GroundingViolation { claims: Vec<String> },

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Session {0} cancelled")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ContextError {
    /// Whether the bounded retry policy may re-run the failing stage
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ContextError::ModelTimeout { .. }
                | ContextError::NoEligibleModel { .. }
                | ContextError::ModelInvocation(_)
                | ContextError::Embedding(_)
        )
    }

    /// Short machine-readable kind, used for metrics labels and audit entries
    pub fn kind(&self) -> &'static str {
        match self {
            ContextError::Ingestion { .. } => "ingestion",
            ContextError::RetrievalMiss { .. } => "retrieval_miss",
            ContextError::ContradictionUnresolved { .. } => "contradiction_unresolved",
            ContextError::ModelTimeout { .. } => "model_timeout",
            ContextError::NoEligibleModel { .. } => "no_eligible_model",
            ContextError::ModelInvocation(_) => "model_invocation",
            ContextError::GroundingViolation { .. } => "grounding_violation",
            ContextError::Embedding(_) => "embedding",
            ContextError::SessionNotFound(_) => "session_not_found",
            ContextError::SessionClosed(_) => "session_closed",
            ContextError::Cancelled(_) => "cancelled",
            ContextError::Storage(_) => "storage",
            ContextError::Configuration(_) => "configuration",
            ContextError::Internal(_) => "internal",
            ContextError::Io(_) => "io",
            ContextError::Serialization(_) => "serialization",
        }
    }
}

impl From<BudgetError> for ContextError {
    fn from(e: BudgetError) -> Self {
        ContextError::Configuration(e.to_string())
    }
}

impl From<SummarizerError> for ContextError {
    fn from(e: SummarizerError) -> Self {
        ContextError::Internal(format!("summarizer: {}", e))
    }
}

impl From<config::ConfigError> for ContextError {
    fn from(e: config::ConfigError) -> Self {
        ContextError::Configuration(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ContextError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ContextError::Storage(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ContextError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ContextError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = ContextError::ModelTimeout {
            model: "fast".to_string(),
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());

        let grounding = ContextError::GroundingViolation {
            claims: vec!["q3 revenue $20M".to_string()],
        };
        assert!(!grounding.is_retryable());
        assert!(!ContextError::Cancelled("s".to_string()).is_retryable());
    }

    #[test]
    fn test_grounding_message_lists_claims() {
        let err = ContextError::GroundingViolation {
            claims: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Grounding violation: 2 ungrounded claim(s): a; b");
        assert_eq!(err.kind(), "grounding_violation");
    }
}
