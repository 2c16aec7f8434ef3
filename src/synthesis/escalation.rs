//! Escalation of contradictions the resolution policy left open

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::contradiction::{ContradictionRecord, Resolution, ResolutionRule, ResolutionStatus};
use crate::error::Result;
use crate::facts::Fact;

/// Decides records the automatic policy could not.
///
/// Returning `None` leaves the record open and fails the request with
/// `ContradictionUnresolved`.
#[async_trait]
pub trait EscalationHandler: Send + Sync {
    async fn escalate(
        &self,
        record: &ContradictionRecord,
        a: &Fact,
        b: &Fact,
    ) -> Result<Option<Resolution>>;
}

/// Holds open records for review and answers with reviewer decisions
#[derive(Default)]
pub struct ReviewQueue {
    pending: DashMap<String, ContradictionRecord>,
    decisions: DashMap<String, (String, String)>,
}

impl ReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records waiting for a decision, by id
    pub fn pending(&self) -> Vec<ContradictionRecord> {
        let mut records: Vec<ContradictionRecord> =
            self.pending.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Keep `fact_id` for `record_id` the next time the record is escalated
    pub fn decide(&self, record_id: &str, fact_id: &str, rationale: impl Into<String>) {
        self.decisions.insert(
            record_id.to_string(),
            (fact_id.to_string(), rationale.into()),
        );
    }
}

#[async_trait]
impl EscalationHandler for ReviewQueue {
    async fn escalate(
        &self,
        record: &ContradictionRecord,
        _a: &Fact,
        _b: &Fact,
    ) -> Result<Option<Resolution>> {
        let decision = self.decisions.get(&record.id).map(|d| d.value().clone());
        let Some((fact_id, rationale)) = decision else {
            self.pending.insert(record.id.clone(), record.clone());
            info!("Contradiction {} queued for review", record.id);
            return Ok(None);
        };

        let status = if fact_id == "merge" {
            Some(ResolutionStatus::ResolvedMerged)
        } else {
            record.status_keeping(&fact_id)
        };
        let Some(status) = status else {
            self.pending.insert(record.id.clone(), record.clone());
            return Ok(None);
        };

        self.pending.remove(&record.id);
        Ok(Some(Resolution {
            status,
            rule: ResolutionRule::Escalation,
            rationale,
        }))
    }
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
                provenance: "web".to_string(),
                published_at: None,
            },
        };
        let value = FactValue::Money {
            amount,
            currency: "USD".to_string(),
        };
        Fact::new("q3", "revenue", value, &chunk, 0.9, "test", 0.5)
    }

    #[tokio::test]
    async fn test_queues_until_decided() {
        let a = fact("d#0000", 10.0);
        let b = fact("d#0001", 12.0);
        let record = ContradictionRecord::new(&a, &b, "amounts differ");
        let queue = ReviewQueue::new();

        assert!(queue.escalate(&record, &a, &b).await.unwrap().is_none());
        assert_eq!(queue.pending().len(), 1);

        queue.decide(&record.id, &b.id, "confirmed with finance");
        let resolution = queue.escalate(&record, &a, &b).await.unwrap().unwrap();
        assert_eq!(resolution.rule, ResolutionRule::Escalation);
        assert_eq!(resolution.status, record.status_keeping(&b.id).unwrap());
        assert!(queue.pending().is_empty());
    }
}
