//! Memory events, session scope and batches

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::contradiction::ContradictionRecord;
use crate::error::{ContextError, Result};
use crate::facts::Fact;

/// Retrieval performed on behalf of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRecord {
    pub request_id: String,
    pub query: String,
    pub chunk_ids: Vec<String>,
    pub expanded: bool,
    pub at: DateTime<Utc>,
}

/// One emitted content block, in session order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStep {
    pub request_id: String,
    pub topic: String,
    pub model: String,
    pub citations: Vec<String>,
    pub fact_ids: Vec<String>,
    pub at: DateTime<Utc>,
}

/// A fact rejected by a contradiction resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupersededFact {
    pub fact: Fact,
    pub record_id: String,
}

/// Every mutation of session memory, plus audit-only entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryEvent {
    SessionStarted,
    FactRecorded { fact: Fact },
    FactSuperseded { fact_id: String, record_id: String },
    /// Inserts a record or replaces it with a later state of itself
    ContradictionRecorded { record: ContradictionRecord },
    RetrievalRecorded { record: RetrievalRecord },
    ChunksSeen { chunk_ids: Vec<String> },
    SummaryUpdated { summary: String },
    StepRecorded { step: GenerationStep },
    /// Applied all-or-nothing
    Batch {
        request_id: String,
        events: Vec<MemoryEvent>,
    },
    RetryAttempted {
        request_id: String,
        stage: String,
        attempt: u32,
        error: String,
    },
    RequestFailed {
        request_id: String,
        stage: String,
        error: String,
    },
    CommittedToLongTerm { added: usize, duplicates: usize },
    SessionCancelled,
    SessionEnded { committed: bool },
}

impl MemoryEvent {
    /// Audit-only events leave the scope untouched
    pub fn is_audit_only(&self) -> bool {
        matches!(
            self,
            MemoryEvent::SessionStarted
                | MemoryEvent::RetryAttempted { .. }
                | MemoryEvent::RequestFailed { .. }
                | MemoryEvent::CommittedToLongTerm { .. }
                | MemoryEvent::SessionCancelled
                | MemoryEvent::SessionEnded { .. }
        )
    }
}

/// A line of the per-session audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub session_id: String,
    pub at: DateTime<Utc>,
    pub event: MemoryEvent,
}

/// Everything a session has accepted so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionScope {
    pub session_id: String,
    pub accepted: IndexMap<String, Fact>,
    pub superseded: IndexMap<String, SupersededFact>,
    pub contradictions: IndexMap<String, ContradictionRecord>,
    pub retrievals: Vec<RetrievalRecord>,
    pub summary: String,
    pub known_chunks: BTreeSet<String>,
    pub steps: Vec<GenerationStep>,
}

impl SessionScope {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn apply(&mut self, event: &MemoryEvent) -> Result<()> {
        match event {
            MemoryEvent::FactRecorded { fact } => {
                if !fact.is_attributed() {
                    return Err(ContextError::Internal(format!(
                        "fact {} has no supporting chunk",
                        fact.id
                    )));
                }
                if !self.superseded.contains_key(&fact.id) {
                    self.accepted.entry(fact.id.clone()).or_insert_with(|| fact.clone());
                }
            }
            MemoryEvent::FactSuperseded { fact_id, record_id } => {
                if let Some(fact) = self.accepted.shift_remove(fact_id) {
                    self.superseded.insert(
                        fact_id.clone(),
                        SupersededFact {
                            fact,
                            record_id: record_id.clone(),
                        },
                    );
                } else if !self.superseded.contains_key(fact_id) {
                    return Err(ContextError::Internal(format!(
                        "cannot supersede unknown fact {}",
                        fact_id
                    )));
                }
            }
            MemoryEvent::ContradictionRecorded { record } => {
                if let Some(existing) = self.contradictions.get(&record.id) {
                    if existing.transitions.len() > record.transitions.len() {
                        return Err(ContextError::Internal(format!(
                            "contradiction {} would lose history",
                            record.id
                        )));
                    }
                }
                self.contradictions.insert(record.id.clone(), record.clone());
            }
            MemoryEvent::RetrievalRecorded { record } => self.retrievals.push(record.clone()),
            MemoryEvent::ChunksSeen { chunk_ids } => {
                self.known_chunks.extend(chunk_ids.iter().cloned());
            }
            MemoryEvent::SummaryUpdated { summary } => self.summary = summary.clone(),
            MemoryEvent::StepRecorded { step } => self.steps.push(step.clone()),
            MemoryEvent::Batch { events, .. } => {
                for e in events {
                    self.apply(e)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn known_pairs(&self) -> HashSet<(String, String)> {
        self.contradictions.values().map(|r| r.pair()).collect()
    }

    pub fn open_contradictions(&self) -> impl Iterator<Item = &ContradictionRecord> {
        self.contradictions.values().filter(|r| r.is_open())
    }

    pub fn is_superseded(&self, fact_id: &str) -> bool {
        self.superseded.contains_key(fact_id)
    }

    pub fn knows_chunk(&self, chunk_id: &str) -> bool {
        self.known_chunks.contains(chunk_id)
    }
}

/// Mutations staged by one request, applied atomically when it emits
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryBatch {
    pub request_id: String,
    pub events: Vec<MemoryEvent>,
}

impl MemoryBatch {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            events: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn record_fact(&mut self, fact: Fact) -> &mut Self {
        self.events.push(MemoryEvent::FactRecorded { fact });
        self
    }

    pub fn supersede(&mut self, fact_id: impl Into<String>, record_id: impl Into<String>) -> &mut Self {
        self.events.push(MemoryEvent::FactSuperseded {
            fact_id: fact_id.into(),
            record_id: record_id.into(),
        });
        self
    }

    pub fn record_contradiction(&mut self, record: ContradictionRecord) -> &mut Self {
        self.events.push(MemoryEvent::ContradictionRecorded { record });
        self
    }

    pub fn record_retrieval(&mut self, record: RetrievalRecord) -> &mut Self {
        self.events.push(MemoryEvent::RetrievalRecorded { record });
        self
    }

    pub fn mark_chunks_seen(&mut self, chunk_ids: Vec<String>) -> &mut Self {
        if !chunk_ids.is_empty() {
            self.events.push(MemoryEvent::ChunksSeen { chunk_ids });
        }
        self
    }

    pub fn update_summary(&mut self, summary: impl Into<String>) -> &mut Self {
        self.events.push(MemoryEvent::SummaryUpdated {
            summary: summary.into(),
        });
        self
    }

    pub fn record_step(&mut self, step: GenerationStep) -> &mut Self {
        self.events.push(MemoryEvent::StepRecorded { step });
        self
    }

    pub fn into_event(self) -> MemoryEvent {
        MemoryEvent::Batch {
            request_id: self.request_id,
            events: self.events,
        }
    }
}

/// Facts and summary relevant to a topic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recall {
    pub facts: Vec<Fact>,
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{Chunk, SourceInfo, TextRange};
    use crate::facts::FactValue;

    fn fact(chunk_id: &str, amount: f64) -> Fact {
        let chunk = Chunk {
            id: chunk_id.to_string(),
            document_id: "deck".to_string(),
            ordinal: 0,
            range: TextRange::new(0, 1),
            text: String::new(),
            token_count: 0,
            source: SourceInfo {
                document_id: "deck".to_string(),
                title: "Deck".to_string(),
                provenance: "memo".to_string(),
                published_at: None,
            },
        };
        let value = FactValue::Money {
            amount,
            currency: "USD".to_string(),
        };
        Fact::new("q3", "revenue", value, &chunk, 0.9, "test", 0.5)
    }

    #[test]
    fn test_batch_applies_in_order() {
        let a = fact("deck#0000", 10.0);
        let mut batch = MemoryBatch::new("req-1");
        batch
            .record_fact(a.clone())
            .supersede(a.id.clone(), "contra-1")
            .mark_chunks_seen(vec!["deck#0000".to_string()]);

        let mut scope = SessionScope::new("s");
        scope.apply(&batch.into_event()).unwrap();

        assert!(scope.accepted.is_empty());
        assert!(scope.is_superseded(&a.id));
        assert!(scope.knows_chunk("deck#0000"));
    }

    #[test]
    fn test_superseded_fact_is_not_reaccepted() {
        let a = fact("deck#0000", 10.0);
        let mut scope = SessionScope::new("s");
        scope.apply(&MemoryEvent::FactRecorded { fact: a.clone() }).unwrap();
        scope
            .apply(&MemoryEvent::FactSuperseded {
                fact_id: a.id.clone(),
                record_id: "r".to_string(),
            })
            .unwrap();
        scope.apply(&MemoryEvent::FactRecorded { fact: a.clone() }).unwrap();
        assert!(scope.accepted.is_empty());
    }

    #[test]
    fn test_unattributed_fact_rejected() {
        let mut a = fact("deck#0000", 10.0);
        a.supporting.clear();
        let mut scope = SessionScope::new("s");
        assert!(scope.apply(&MemoryEvent::FactRecorded { fact: a }).is_err());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_string(&MemoryEvent::SessionCancelled).unwrap();
        assert_eq!(json, r#"{"type":"session_cancelled"}"#);
    }
}
