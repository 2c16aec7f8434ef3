//! Contradiction records and status transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{ContextError, Result};
use crate::facts::Fact;

/// Lifecycle state of a contradiction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Open,
    ResolvedKeptA,
    ResolvedKeptB,
    ResolvedMerged,
}

/// Which rule produced a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    SourceTrust,
    Confidence,
    Recency,
    /// Decided by an external escalation handler
    Escalation,
}

impl fmt::Display for ResolutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionRule::SourceTrust => "source_trust",
            ResolutionRule::Confidence => "confidence",
            ResolutionRule::Recency => "recency",
            ResolutionRule::Escalation => "escalation",
        };
        f.write_str(name)
    }
}

/// Outcome proposed by a policy or escalation handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub status: ResolutionStatus,
    pub rule: ResolutionRule,
    pub rationale: String,
}

/// One entry in a record's append-only history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub status: ResolutionStatus,
    pub kept: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<ResolutionRule>,
    pub rationale: String,
    pub at: DateTime<Utc>,
}

/// Conflict between two facts on the same (entity, predicate).
///
/// `fact_a` is always the smaller fact id, so a pair maps to one record id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionRecord {
    pub id: String,
    pub fact_a: String,
    pub fact_b: String,
    pub entity: String,
    pub predicate: String,
    pub status: ResolutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<ResolutionRule>,
    pub rationale: String,
    pub kept: Vec<String>,
    pub transitions: Vec<StatusTransition>,
}

impl ContradictionRecord {
    pub fn new(a: &Fact, b: &Fact, rationale: impl Into<String>) -> Self {
        let (fact_a, fact_b) = Self::pair_key(&a.id, &b.id);
        let rationale = rationale.into();
        let id = Self::compute_id(&fact_a, &fact_b);
        Self {
            id,
            fact_a,
            fact_b,
            entity: a.entity.clone(),
            predicate: a.predicate.clone(),
            status: ResolutionStatus::Open,
            rule: None,
            rationale: rationale.clone(),
            kept: Vec::new(),
            transitions: vec![StatusTransition {
                status: ResolutionStatus::Open,
                kept: Vec::new(),
                rule: None,
                rationale,
                at: Utc::now(),
            }],
        }
    }

    /// Order-independent key for a fact pair
    pub fn pair_key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    fn compute_id(a: &str, b: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(a.as_bytes());
        hasher.update(b"|");
        hasher.update(b.as_bytes());
        format!("contra-{}", &hex::encode(hasher.finalize())[..16])
    }

    pub fn pair(&self) -> (String, String) {
        (self.fact_a.clone(), self.fact_b.clone())
    }

    pub fn is_open(&self) -> bool {
        self.status == ResolutionStatus::Open
    }

    /// The fact id rejected by the resolution, if any
    pub fn loser(&self) -> Option<&str> {
        match self.status {
            ResolutionStatus::ResolvedKeptA => Some(&self.fact_b),
            ResolutionStatus::ResolvedKeptB => Some(&self.fact_a),
            _ => None,
        }
    }

    /// Which of `fact_a`/`fact_b` a resolution keeping `fact_id` maps to
    pub fn status_keeping(&self, fact_id: &str) -> Option<ResolutionStatus> {
        if fact_id == self.fact_a {
            Some(ResolutionStatus::ResolvedKeptA)
        } else if fact_id == self.fact_b {
            Some(ResolutionStatus::ResolvedKeptB)
        } else {
            None
        }
    }

    /// Apply a resolution by appending a transition. Only open records resolve.
    pub fn resolve(&mut self, resolution: Resolution) -> Result<()> {
        if !self.is_open() {
            return Err(ContextError::Internal(format!(
                "contradiction {} is already {:?}",
                self.id, self.status
            )));
        }
        let kept = match resolution.status {
            ResolutionStatus::Open => {
                return Err(ContextError::Internal(
                    "cannot resolve a contradiction to Open".to_string(),
                ))
            }
            ResolutionStatus::ResolvedKeptA => vec![self.fact_a.clone()],
            ResolutionStatus::ResolvedKeptB => vec![self.fact_b.clone()],
            ResolutionStatus::ResolvedMerged => vec![self.fact_a.clone(), self.fact_b.clone()],
        };

        self.transitions.push(StatusTransition {
            status: resolution.status,
            kept: kept.clone(),
            rule: Some(resolution.rule),
            rationale: resolution.rationale.clone(),
            at: Utc::now(),
        });
        self.status = resolution.status;
        self.rule = Some(resolution.rule);
        self.rationale = resolution.rationale;
        self.kept = kept;
        Ok(())
    }
}
