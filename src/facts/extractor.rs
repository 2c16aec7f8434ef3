//! Rule-based fact extraction

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;

use super::models::{Fact, FactsConfig};
use super::value::{FactValue, ValueParser};
use crate::chunking::Chunk;
use crate::error::{ContextError, Result};

/// Fact extractor trait
#[async_trait]
pub trait FactExtractor: Send + Sync {
    /// Version tag recorded on every fact
    fn version(&self) -> &str;

    async fn extract(&self, chunk: &Chunk) -> Result<Vec<Fact>>;
}

pub const PATTERN_EXTRACTOR_VERSION: &str = "pattern-v1";

const HEDGES: &[&str] = &[
    "approximately",
    "about",
    "around",
    "roughly",
    "nearly",
    "almost",
    "estimated",
    "an estimated",
    "expected",
    "projected",
    "likely",
    "possibly",
    "perhaps",
    "may",
    "might",
    "could",
    "up to",
    "~",
];

const LEADING_DETERMINERS: &[&str] = &["the", "a", "an", "our", "its", "their", "his", "her", "this", "that"];

const EXPLICIT_CONFIDENCE: f32 = 0.9;
const COPULA_CONFIDENCE: f32 = 0.8;
const HEDGE_PENALTY: f32 = 0.7;
const UNTYPED_PENALTY: f32 = 0.75;

/// Deterministic extractor over sentence patterns:
/// `<subject> = <value>`, `<subject>: <value>`, `| <subject> | <value> |`
/// and `<subject> is|was|reached|totaled|... <value>`.
///
/// Output depends only on the chunk, so re-extraction yields identical facts.
pub struct PatternExtractor {
    config: FactsConfig,
    values: ValueParser,
    explicit: Regex,
    copula: Regex,
}

impl PatternExtractor {
    pub fn new(config: FactsConfig) -> Result<Self> {
        let build = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| ContextError::Internal(format!("invalid fact pattern: {}", e)))
        };
        Ok(Self {
            config,
            values: ValueParser::new()?,
            explicit: build(r"^(?P<subject>[^=:|]{1,120}?)\s*(?:=|:)\s*(?P<value>\S.*)$")?,
            copula: build(
                r"(?i)^(?P<subject>.+?)\s+(?:is|was|are|were|reached|totaled|totalled|stood at|amounted to|came in at|rose to|fell to|grew to)\s+(?P<value>.+)$",
            )?,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(FactsConfig::default())
    }

    /// Extract facts synchronously; the async trait method delegates here
    pub fn extract_sync(&self, chunk: &Chunk) -> Vec<Fact> {
        let mut facts = Vec::new();
        let mut seen = HashSet::new();

        for sentence in split_sentences(&chunk.text) {
            let Some((subject, value_raw, base)) = self.match_sentence(sentence) else {
                continue;
            };
            let Some((entity, predicate)) = self.split_subject(subject, chunk) else {
                continue;
            };

            let (value_raw, hedged) = strip_hedges(value_raw);
            let hedged = hedged || contains_hedge(subject);
            if value_raw.is_empty() {
                continue;
            }
            let value = self.values.parse(value_raw);
            if matches!(&value, FactValue::Text { text } if text.is_empty()) {
                continue;
            }

            let mut confidence = base;
            if hedged {
                confidence *= HEDGE_PENALTY;
            }
            if !value.is_typed() {
                confidence *= UNTYPED_PENALTY;
            }

            let fact = Fact::new(
                &entity,
                &predicate,
                value,
                chunk,
                confidence,
                PATTERN_EXTRACTOR_VERSION,
                self.config.confidence_floor,
            );
            if seen.insert(fact.id.clone()) {
                facts.push(fact);
            }
        }

        facts
    }

    fn match_sentence<'a>(&self, sentence: &'a str) -> Option<(&'a str, &'a str, f32)> {
        let sentence = sentence.trim();
        if sentence.starts_with('|') {
            return table_row(sentence).map(|(s, v)| (s, v, EXPLICIT_CONFIDENCE));
        }
        if let Some(c) = self.explicit.captures(sentence) {
            let subject = c.name("subject")?.as_str();
            let value = c.name("value")?.as_str();
            return Some((subject, value, EXPLICIT_CONFIDENCE));
        }
        if let Some(c) = self.copula.captures(sentence) {
            let subject = c.name("subject")?.as_str();
            let value = c.name("value")?.as_str();
            return Some((subject, value, COPULA_CONFIDENCE));
        }
        None
    }

    /// Subject to (entity, predicate): `X of Y` gives predicate X and entity Y,
    /// otherwise the last word is the predicate and the rest the entity.
    /// A single-word subject is attributed to the document title.
    fn split_subject(&self, subject: &str, chunk: &Chunk) -> Option<(String, String)> {
        let cleaned = subject
            .trim()
            .trim_start_matches(['#', '-', '*', '•'])
            .trim();
        let mut words: Vec<&str> = cleaned.split_whitespace().collect();
        while let Some(first) = words.first() {
            if LEADING_DETERMINERS.contains(&first.to_lowercase().as_str()) {
                words.remove(0);
            } else {
                break;
            }
        }
        if words.is_empty() || words.len() > self.config.max_subject_words {
            return None;
        }

        if let Some(pos) = words.iter().position(|w| w.eq_ignore_ascii_case("of")) {
            if pos > 0 && pos + 1 < words.len() {
                let predicate = words[..pos].join(" ");
                let mut rest = &words[pos + 1..];
                while let Some(first) = rest.first() {
                    if LEADING_DETERMINERS.contains(&first.to_lowercase().as_str()) {
                        rest = &rest[1..];
                    } else {
                        break;
                    }
                }
                if !rest.is_empty() {
                    return Some((rest.join(" "), predicate));
                }
            }
        }

        match words.split_last() {
            Some((last, [])) => Some((chunk.source.title.clone(), last.to_string())),
            Some((last, rest)) => Some((rest.join(" "), last.to_string())),
            None => None,
        }
    }
}

#[async_trait]
impl FactExtractor for PatternExtractor {
    fn version(&self) -> &str {
        PATTERN_EXTRACTOR_VERSION
    }

    async fn extract(&self, chunk: &Chunk) -> Result<Vec<Fact>> {
        Ok(self.extract_sync(chunk))
    }
}

/// Two non-empty cells; separator rows are skipped
fn table_row(line: &str) -> Option<(&str, &str)> {
    let cells: Vec<&str> = line
        .trim_matches('|')
        .split('|')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if cells.len() != 2 {
        return None;
    }
    if cells
        .iter()
        .any(|c| c.chars().all(|ch| matches!(ch, '-' | ':' | ' ')))
    {
        return None;
    }
    Some((cells[0], cells[1]))
}

/// Split on line breaks and on `.`, `!`, `?` followed by whitespace
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    for line in text.lines() {
        let bytes = line.as_bytes();
        let mut start = 0;
        for (i, b) in bytes.iter().enumerate() {
            let terminal = matches!(b, b'.' | b'!' | b'?');
            let followed_by_space = bytes.get(i + 1).map_or(true, |n| n.is_ascii_whitespace());
            if terminal && followed_by_space {
                let sentence = line[start..=i].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = i + 1;
            }
        }
        let rest = line[start..].trim();
        if !rest.is_empty() {
            out.push(rest);
        }
    }
    out
}

fn strip_hedges(value: &str) -> (&str, bool) {
    let mut v = value.trim();
    let mut hedged = false;
    loop {
        let lower = v.to_lowercase();
        let found = HEDGES.iter().find(|h| {
            lower.starts_with(*h)
                && lower[h.len()..]
                    .chars()
                    .next()
                    .map_or(true, |c| !c.is_alphanumeric() || **h == "~")
        });
        match found {
            Some(h) => {
                v = v[h.len()..].trim_start();
                hedged = true;
            }
            None => break,
        }
    }
    (v, hedged)
}

fn contains_hedge(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| HEDGES.contains(&w) && w.len() > 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{SourceInfo, TextRange};

    fn chunk(text: &str) -> Chunk {
        Chunk {
            id: "deck#0000".to_string(),
            document_id: "deck".to_string(),
            ordinal: 0,
            range: TextRange::new(0, text.len()),
            text: text.to_string(),
            token_count: text.split_whitespace().count(),
            source: SourceInfo {
                document_id: "deck".to_string(),
                title: "Board Deck".to_string(),
                provenance: "memo".to_string(),
                published_at: None,
            },
        }
    }

    fn extractor() -> PatternExtractor {
        PatternExtractor::with_defaults().unwrap()
    }

    #[test]
    fn test_explicit_assignment() {
        let facts = extractor().extract_sync(&chunk("Q3 revenue = $10M"));
        assert_eq!(facts.len(), 1);
        let f = &facts[0];
        assert_eq!(f.entity, "q3");
        assert_eq!(f.predicate, "revenue");
        assert_eq!(f.value.numeric(), Some(10_000_000.0));
        assert!((f.confidence - EXPLICIT_CONFIDENCE).abs() < 1e-6);
        assert_eq!(f.extractor, PATTERN_EXTRACTOR_VERSION);
    }

    #[test]
    fn test_copula_and_of_form() {
        let facts = extractor().extract_sync(&chunk(
            "The revenue of Acme in Q3 reached $12M. Headcount was 1,200 employees.",
        ));
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].entity, "acme in q3");
        assert_eq!(facts[0].predicate, "revenue");
        assert_eq!(facts[1].entity, "board deck");
        assert_eq!(facts[1].predicate, "headcount");
    }

    #[test]
    fn test_hedge_lowers_confidence() {
        let plain = extractor().extract_sync(&chunk("Q3 revenue was $10M."));
        let hedged = extractor().extract_sync(&chunk("Q3 revenue was approximately $10M."));
        assert_eq!(plain[0].value, hedged[0].value);
        assert!(hedged[0].confidence < plain[0].confidence);
    }

    #[test]
    fn test_low_confidence_facts_are_kept() {
        let facts = extractor().extract_sync(&chunk("Project codename is possibly Falcon."));
        assert_eq!(facts.len(), 1);
        assert!(facts[0].low_confidence);
    }

    #[test]
    fn test_table_rows() {
        let text = "| metric | value |\n|---|---|\n| Q3 revenue | $12M |";
        let facts = extractor().extract_sync(&chunk(text));
        let revenue: Vec<_> = facts.iter().filter(|f| f.predicate == "revenue").collect();
        assert_eq!(revenue.len(), 1);
        assert_eq!(revenue[0].value.numeric(), Some(12_000_000.0));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let c = chunk("Q3 revenue = $10M. Churn was 4%.");
        let a: Vec<String> = extractor().extract_sync(&c).into_iter().map(|f| f.id).collect();
        let b: Vec<String> = extractor().extract_sync(&c).into_iter().map(|f| f.id).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sentence_split_keeps_decimals() {
        let s = split_sentences("Revenue was €2.5 billion. Margin was 12%.");
        assert_eq!(s, vec!["Revenue was €2.5 billion.", "Margin was 12%."]);
    }

    #[test]
    fn test_long_prose_subject_skipped() {
        let facts = extractor().extract_sync(&chunk(
            "The thing we learned over the last several quarters of hard work is patience.",
        ));
        assert!(facts.is_empty());
    }
}
