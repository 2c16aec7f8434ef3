//! Model-backed fact extraction

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::extractor::FactExtractor;
use super::models::{Fact, FactsConfig};
use super::value::ValueParser;
use crate::chunking::Chunk;
use crate::error::Result;
use crate::router::{ModelBackend, ModelRequest};

const SYSTEM_PROMPT: &str = "You extract atomic facts from business documents. \
Answer with one JSON object per line and nothing else. Each object has the keys \
\"entity\", \"predicate\", \"value\" and optionally \"confidence\" (0 to 1). \
Only report facts stated explicitly in the text.";

#[derive(Debug, Deserialize)]
struct ExtractedLine {
    entity: String,
    predicate: String,
    value: serde_json::Value,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Asks a model backend for JSON-lines facts
pub struct ModelExtractor {
    backend: Arc<dyn ModelBackend>,
    config: FactsConfig,
    values: ValueParser,
    version: String,
}

impl ModelExtractor {
    pub fn new(backend: Arc<dyn ModelBackend>, config: FactsConfig) -> Result<Self> {
        let version = format!("model-v1:{}", backend.name());
        Ok(Self {
            backend,
            config,
            values: ValueParser::new()?,
            version,
        })
    }

    fn parse_output(&self, output: &str, chunk: &Chunk) -> Vec<Fact> {
        let mut facts = Vec::new();
        for line in output.lines() {
            let line = line.trim().trim_end_matches(',');
            if line.is_empty() || line.starts_with("```") {
                continue;
            }
            let parsed: ExtractedLine = match serde_json::from_str(line) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping malformed fact line from {}: {}", self.backend.name(), e);
                    continue;
                }
            };
            if parsed.entity.trim().is_empty() || parsed.predicate.trim().is_empty() {
                continue;
            }

            let raw_value = match &parsed.value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let confidence = parsed
                .confidence
                .unwrap_or(self.config.default_model_confidence);

            facts.push(Fact::new(
                &parsed.entity,
                &parsed.predicate,
                self.values.parse(&raw_value),
                chunk,
                confidence,
                &self.version,
                self.config.confidence_floor,
            ));
        }
        facts
    }
}

#[async_trait]
impl FactExtractor for ModelExtractor {
    fn version(&self) -> &str {
        &self.version
    }

    async fn extract(&self, chunk: &Chunk) -> Result<Vec<Fact>> {
        let request = ModelRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: chunk.text.clone(),
            max_tokens: 1024,
            temperature: 0.0,
        };
        let response = self.backend.invoke(&request).await?;
        let facts = self.parse_output(&response.text, chunk);
        debug!("Model extracted {} facts from chunk {}", facts.len(), chunk.id);
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{SourceInfo, TextRange};
    use crate::router::ModelResponse;

    struct Canned(&'static str);

    #[async_trait]
    impl ModelBackend for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn invoke(&self, _request: &ModelRequest) -> Result<ModelResponse> {
            Ok(ModelResponse {
                text: self.0.to_string(),
                model: "canned".to_string(),
                prompt_tokens: None,
                completion_tokens: None,
            })
        }
    }

    fn chunk() -> Chunk {
        Chunk {
            id: "deck#0000".to_string(),
            document_id: "deck".to_string(),
            ordinal: 0,
            range: TextRange::new(0, 10),
            text: "Q3 revenue was $10M".to_string(),
            token_count: 4,
            source: SourceInfo {
                document_id: "deck".to_string(),
                title: "Deck".to_string(),
                provenance: "memo".to_string(),
                published_at: None,
            },
        }
    }

    #[tokio::test]
    async fn test_parses_lines_and_skips_garbage() {
        let output = "{\"entity\":\"Q3\",\"predicate\":\"revenue\",\"value\":\"$10M\",\"confidence\":0.95}\n\
                      not json at all\n\
                      {\"entity\":\"Acme\",\"predicate\":\"headcount\",\"value\":1200}";
        let extractor = ModelExtractor::new(Arc::new(Canned(output)), FactsConfig::default()).unwrap();
        let facts = extractor.extract(&chunk()).await.unwrap();

        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].value.numeric(), Some(10_000_000.0));
        assert!((facts[0].confidence - 0.95).abs() < 1e-6);
        assert!((facts[1].confidence - 0.6).abs() < 1e-6);
        assert_eq!(facts[1].extractor, "model-v1:canned");
    }
}
