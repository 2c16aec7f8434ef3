//! Request, stage and content-block types

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::contradiction::ContradictionRecord;
use crate::error::ContextError;
use crate::facts::Fact;
use crate::index::SearchMode;
use crate::router::{Relaxation, TaskDescriptor};

/// Pipeline stages of one content-block request, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStage {
    QueryFormed,
    Retrieved,
    FactsChecked,
    ContradictionsResolved,
    ModelInvoked,
    Validated,
    Emitted,
    Failed,
}

impl SynthesisStage {
    /// Only retrieval and model invocation are re-run on retryable errors
    pub fn is_retryable(&self) -> bool {
        matches!(self, SynthesisStage::Retrieved | SynthesisStage::ModelInvoked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisStage::QueryFormed => "query_formed",
            SynthesisStage::Retrieved => "retrieved",
            SynthesisStage::FactsChecked => "facts_checked",
            SynthesisStage::ContradictionsResolved => "contradictions_resolved",
            SynthesisStage::ModelInvoked => "model_invoked",
            SynthesisStage::Validated => "validated",
            SynthesisStage::Emitted => "emitted",
            SynthesisStage::Failed => "failed",
        }
    }
}

impl fmt::Display for SynthesisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for one content block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRequest {
    pub request_id: String,
    pub session_id: String,
    /// Outline topic the block is about
    pub topic: String,
    pub task: TaskDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub mode: SearchMode,
}

impl ContentRequest {
    pub fn new(session_id: impl Into<String>, topic: impl Into<String>, task: TaskDescriptor) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            topic: topic.into(),
            task,
            top_k: None,
            mode: SearchMode::Hybrid,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Marker in the generated text and the fact it points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// e.g. `F2`
    pub marker: String,
    pub fact_id: String,
    pub chunk_id: String,
    pub document_id: String,
}

/// Verified, citation-linked output of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub request_id: String,
    pub session_id: String,
    pub topic: String,
    pub text: String,
    /// Supporting chunk ids, in order of first use
    pub citations: Vec<String>,
    pub sources: Vec<Citation>,
    /// Facts the text relies on
    pub facts: Vec<Fact>,
    /// Contradictions resolved while preparing this block
    pub resolutions: Vec<ContradictionRecord>,
    pub model: String,
    pub relaxations: Vec<Relaxation>,
    pub attempts: u32,
}

/// A request that ended in the Failed stage
#[derive(Debug, Error)]
#[error("Request {request_id} in session {session_id} failed at {stage} after {attempts} attempt(s): {error}")]
pub struct SynthesisFailure {
    /// Stage the error occurred in
    pub stage: SynthesisStage,
    pub session_id: String,
    pub request_id: String,
    pub attempts: u32,
    #[source]
    pub error: ContextError,
}

impl SynthesisFailure {
    pub fn new(stage: SynthesisStage, request: &ContentRequest, attempts: u32, error: ContextError) -> Self {
        Self {
            stage,
            session_id: request.session_id.clone(),
            request_id: request.request_id.clone(),
            attempts,
            error,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, ContextError::Cancelled(_))
    }
}

impl From<SynthesisFailure> for ContextError {
    fn from(failure: SynthesisFailure) -> Self {
        failure.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::TaskType;

    #[test]
    fn test_stage_order_follows_pipeline() {
        assert!(SynthesisStage::QueryFormed < SynthesisStage::Retrieved);
        assert!(SynthesisStage::ModelInvoked < SynthesisStage::Validated);
        assert!(SynthesisStage::Retrieved.is_retryable());
        assert!(!SynthesisStage::Validated.is_retryable());
    }

    #[test]
    fn test_failure_message_carries_context() {
        let request = ContentRequest::new("s1", "Q3 revenue", TaskDescriptor::new(TaskType::Outline))
            .with_request_id("r1");
        let failure = SynthesisFailure::new(
            SynthesisStage::Retrieved,
            &request,
            2,
            ContextError::RetrievalMiss {
                query: "q".to_string(),
                found: 0,
                required: 1,
            },
        );
        let message = failure.to_string();
        assert!(message.contains("r1"));
        assert!(message.contains("s1"));
        assert!(message.contains("retrieved"));
    }
}
