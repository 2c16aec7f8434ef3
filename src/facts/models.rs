//! Fact data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::value::{normalize_text, FactValue};
use crate::chunking::{Chunk, TextRange};

/// Reference to the chunk a fact was read from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub document_id: String,
    pub range: TextRange,
}

impl From<&Chunk> for ChunkRef {
    fn from(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            range: chunk.range,
        }
    }
}

/// Typed (entity, predicate, value) tuple with provenance.
///
/// Facts are never edited; a superseded fact is recorded as such in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    /// Hash of entity, predicate and supporting chunk; the dedup key
    pub identity: String,
    pub entity: String,
    pub predicate: String,
    pub value: FactValue,
    pub supporting: Vec<ChunkRef>,
    pub confidence: f32,
    pub low_confidence: bool,
    pub provenance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_published_at: Option<DateTime<Utc>>,
    pub extractor: String,
    pub observed_at: DateTime<Utc>,
}

/// Normalize an entity or predicate for grouping
pub fn normalize_key(raw: &str) -> String {
    normalize_text(raw)
}

impl Fact {
    /// Build a fact read from `chunk`. Confidence is clamped to [0, 1];
    /// anything below `floor` is kept and flagged low-confidence.
    pub fn new(
        entity: &str,
        predicate: &str,
        value: FactValue,
        chunk: &Chunk,
        confidence: f32,
        extractor: &str,
        floor: f32,
    ) -> Self {
        let entity = normalize_key(entity);
        let predicate = normalize_key(predicate);
        let identity = Self::compute_identity(&entity, &predicate, &chunk.id);
        let id = Self::compute_id(&identity, &value);
        let confidence = confidence.clamp(0.0, 1.0);

        Self {
            id,
            identity,
            entity,
            predicate,
            value,
            supporting: vec![ChunkRef::from(chunk)],
            confidence,
            low_confidence: confidence < floor,
            provenance: chunk.source.provenance.clone(),
            source_published_at: chunk.source.published_at,
            extractor: extractor.to_string(),
            observed_at: Utc::now(),
        }
    }

    /// sha256(entity | predicate | chunk id), hex encoded
    pub fn compute_identity(entity: &str, predicate: &str, chunk_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entity.as_bytes());
        hasher.update(b"|");
        hasher.update(predicate.as_bytes());
        hasher.update(b"|");
        hasher.update(chunk_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn compute_id(identity: &str, value: &FactValue) -> String {
        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        hasher.update(b"|");
        hasher.update(value.normalized().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("fact-{}", &digest[..16])
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.entity, &self.predicate)
    }

    pub fn primary_chunk(&self) -> Option<&ChunkRef> {
        self.supporting.first()
    }

    pub fn is_attributed(&self) -> bool {
        !self.supporting.is_empty()
    }

    /// One-line rendering used in prompts and summaries
    pub fn statement(&self) -> String {
        format!("{} {}: {}", self.entity, self.predicate, self.value)
    }
}

/// Fact extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactsConfig {
    /// "pattern" or "model"
    #[serde(default = "default_extractor")]
    pub extractor: String,

    /// Facts under this confidence are kept but flagged low-confidence
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f32,

    /// Used when a model omits confidence
    #[serde(default = "default_model_confidence")]
    pub default_model_confidence: f32,

    /// Longer subjects are treated as prose, not fact subjects
    #[serde(default = "default_max_subject_words")]
    pub max_subject_words: usize,
}

fn default_extractor() -> String {
    "pattern".to_string()
}

fn default_confidence_floor() -> f32 {
    0.5
}

fn default_model_confidence() -> f32 {
    0.6
}

fn default_max_subject_words() -> usize {
    8
}

impl Default for FactsConfig {
    fn default() -> Self {
        Self {
            extractor: default_extractor(),
            confidence_floor: default_confidence_floor(),
            default_model_confidence: default_model_confidence(),
            max_subject_words: default_max_subject_words(),
        }
    }
}

impl FactsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err("confidence_floor must be within [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.default_model_confidence) {
            return Err("default_model_confidence must be within [0, 1]".to_string());
        }
        if self.max_subject_words == 0 {
            return Err("max_subject_words must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::SourceInfo;

    fn chunk(id: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: "doc".to_string(),
            ordinal: 0,
            range: TextRange::new(0, 10),
            text: "Q3 revenue = $10M".to_string(),
            token_count: 4,
            source: SourceInfo {
                document_id: "doc".to_string(),
                title: "Deck".to_string(),
                provenance: "memo".to_string(),
                published_at: None,
            },
        }
    }

    #[test]
    fn test_identity_is_stable_and_value_independent() {
        let c = chunk("doc#0000");
        let a = Fact::new("Q3", "Revenue", FactValue::text("x"), &c, 0.9, "t", 0.5);
        let b = Fact::new("q3 ", "revenue", FactValue::text("y"), &c, 0.9, "t", 0.5);
        assert_eq!(a.identity, b.identity);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_identity_differs_by_chunk() {
        let a = Fact::new("q3", "revenue", FactValue::text("x"), &chunk("doc#0000"), 0.9, "t", 0.5);
        let b = Fact::new("q3", "revenue", FactValue::text("x"), &chunk("doc#0001"), 0.9, "t", 0.5);
        assert_ne!(a.identity, b.identity);
    }

    #[test]
    fn test_low_confidence_flag_and_clamp() {
        let c = chunk("doc#0000");
        let low = Fact::new("q3", "revenue", FactValue::text("x"), &c, 0.3, "t", 0.5);
        assert!(low.low_confidence);
        let high = Fact::new("q3", "revenue", FactValue::text("x"), &c, 1.5, "t", 0.5);
        assert_eq!(high.confidence, 1.0);
        assert!(!high.low_confidence);
        assert!(high.is_attributed());
        assert_eq!(high.provenance, "memo");
    }
}
