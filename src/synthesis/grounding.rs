//! Grounding check of model output against the supplied facts

use chrono::Datelike;
use regex::Regex;
use std::collections::HashSet;

use super::window::FactWindow;
use crate::chunking::{Chunk, SourceInfo, TextRange};
use crate::contradiction::ToleranceConfig;
use crate::error::{ContextError, Result};
use crate::facts::{normalize_key, Fact, FactValue, FactsConfig, PatternExtractor, ValueParser};

/// Result of checking one output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundingReport {
    /// Window facts the text relies on, in order of first use
    pub used: Vec<String>,
    pub violations: Vec<String>,
}

impl GroundingReport {
    pub fn is_grounded(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> Result<Vec<String>> {
        if self.violations.is_empty() {
            Ok(self.used)
        } else {
            Err(ContextError::GroundingViolation {
                claims: self.violations,
            })
        }
    }

    fn use_fact(&mut self, fact_id: &str) {
        if !self.used.iter().any(|id| id == fact_id) {
            self.used.push(fact_id.to_string());
        }
    }
}

/// Checks that every claim, number and citation marker in generated text
/// traces back to a fact in the window
pub struct GroundingChecker {
    tolerance: ToleranceConfig,
    claims: PatternExtractor,
    values: ValueParser,
    marker: Regex,
    numeric: Regex,
}

impl GroundingChecker {
    pub fn new(tolerance: ToleranceConfig) -> Result<Self> {
        let build = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| ContextError::Internal(format!("invalid grounding pattern: {}", e)))
        };
        // claims are kept regardless of confidence
        let claims = PatternExtractor::new(FactsConfig {
            confidence_floor: 0.0,
            ..FactsConfig::default()
        })?;
        Ok(Self {
            tolerance,
            claims,
            values: ValueParser::new()?,
            marker: build(r"\[(F\d+)\]")?,
            numeric: build(
                r"(?i)(?:[$€£¥]\s?)?\d[\d,]*(?:\.\d+)?(?:\s*(?:%|percent\b|thousand\b|million\b|billion\b|bn\b|mn\b|k\b|m\b|b\b))?",
            )?,
        })
    }

    pub fn check(&self, text: &str, window: &FactWindow, topic: &str) -> GroundingReport {
        let mut report = GroundingReport::default();

        for caps in self.marker.captures_iter(text) {
            let marker = &caps[1];
            match window.by_marker(marker) {
                Some(entry) => report.use_fact(&entry.fact.id),
                None => report
                    .violations
                    .push(format!("citation [{}] does not match a supplied fact", marker)),
            }
        }

        let body = self.marker.replace_all(text, "").into_owned();
        self.check_claims(&body, window, topic, &mut report);
        self.check_numbers(&body, window, topic, &mut report);
        if report.used.is_empty() && report.violations.is_empty() {
            report
                .violations
                .push("output cites none of the supplied facts".to_string());
        }
        report
    }

    fn check_claims(&self, body: &str, window: &FactWindow, topic: &str, report: &mut GroundingReport) {
        let chunk = Chunk {
            id: "output".to_string(),
            document_id: "output".to_string(),
            ordinal: 0,
            range: TextRange::new(0, body.len()),
            text: body.to_string(),
            token_count: 0,
            source: SourceInfo {
                document_id: "output".to_string(),
                title: topic.to_string(),
                provenance: "model".to_string(),
                published_at: None,
            },
        };

        let topic_entity = normalize_key(topic);
        for claim in self.claims.extract_sync(&chunk) {
            match self.support_for(&claim, window, &topic_entity) {
                Ok(fact_id) => report.use_fact(&fact_id),
                Err(violation) => report.violations.push(violation),
            }
        }
    }

    /// A supplied fact with the claim's predicate and an agreeing value.
    /// The entity must match too, unless the claim's subject was a bare
    /// predicate and so resolved to the topic.
    fn support_for(
        &self,
        claim: &Fact,
        window: &FactWindow,
        topic_entity: &str,
    ) -> std::result::Result<String, String> {
        let about_topic = claim.entity == topic_entity;
        let candidates: Vec<&Fact> = window
            .facts()
            .filter(|f| f.predicate == claim.predicate && (about_topic || f.entity == claim.entity))
            .collect();
        if let Some(fact) = candidates
            .iter()
            .find(|f| self.tolerance.conflict(&f.value, &claim.value).is_none())
        {
            return Ok(fact.id.clone());
        }
        match candidates.first() {
            Some(fact) => {
                let marker = window.marker_for(&fact.id).unwrap_or("?");
                Err(format!(
                    "'{}' contradicts [{}] {}",
                    claim.statement(),
                    marker,
                    fact.statement()
                ))
            }
            None => Err(format!("unsupported claim '{}'", claim.statement())),
        }
    }

    fn check_numbers(&self, body: &str, window: &FactWindow, topic: &str, report: &mut GroundingReport) {
        let mut allowed: Vec<f64> = Vec::new();
        for fact in window.facts() {
            allowed.extend(value_numbers(&fact.value));
            allowed.extend(self.bare_numbers(&fact.entity));
            allowed.extend(self.bare_numbers(&fact.predicate));
        }
        allowed.extend(self.bare_numbers(topic));

        let mut reported = HashSet::new();
        for m in self.numeric.find_iter(body) {
            if !self.is_mention(body, m.start(), m.as_str()) {
                continue;
            }
            let Some(value) = self.values.parse(m.as_str()).numeric() else {
                continue;
            };
            let grounded = allowed.iter().any(|a| self.agrees(*a, value));
            let mention = m.as_str().trim().to_string();
            if !grounded && reported.insert(mention.clone()) {
                report
                    .violations
                    .push(format!("number '{}' does not match a supplied value", mention));
            }
        }
    }

    /// Skips digits glued to letters (`Q3`, `FY2024`) and bare single digits
    fn is_mention(&self, body: &str, start: usize, text: &str) -> bool {
        let glued = body[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '#');
        if glued {
            return false;
        }
        let trimmed = text.trim();
        let digits = trimmed.chars().filter(|c| c.is_ascii_digit()).count();
        let bare = trimmed.chars().all(|c| c.is_ascii_digit());
        !(bare && digits == 1)
    }

    fn bare_numbers(&self, text: &str) -> Vec<f64> {
        self.numeric
            .find_iter(text)
            .filter_map(|m| self.values.parse(m.as_str()).numeric())
            .collect()
    }

    fn agrees(&self, a: f64, b: f64) -> bool {
        let allowed = self
            .tolerance
            .absolute
            .max(self.tolerance.relative * a.abs().max(b.abs()));
        (a - b).abs() <= allowed
    }
}

/// Numbers a value legitimately puts in text, including date parts
fn value_numbers(value: &FactValue) -> Vec<f64> {
    match value {
        FactValue::Date { date } => vec![date.year() as f64, date.month() as f64, date.day() as f64],
        FactValue::DateRange { start, end } => vec![
            start.year() as f64,
            start.month() as f64,
            start.day() as f64,
            end.year() as f64,
            end.month() as f64,
            end.day() as f64,
        ],
        other => other.numeric().into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TokenBudgetManager;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: "deck".to_string(),
            ordinal: 0,
            range: TextRange::new(0, text.len()),
            text: text.to_string(),
            token_count: 0,
            source: SourceInfo {
                document_id: "deck".to_string(),
                title: "Quarterly Report".to_string(),
                provenance: "audited_report".to_string(),
                published_at: None,
            },
        }
    }

    fn window() -> FactWindow {
        let extractor = PatternExtractor::with_defaults().unwrap();
        let facts = extractor.extract_sync(&chunk(
            "deck#0001",
            "Q3 revenue = $12M.\nGross margin of Acme was 41%.",
        ));
        assert_eq!(facts.len(), 2);
        FactWindow::assemble(facts, 1_000, &TokenBudgetManager::with_defaults().unwrap())
    }

    fn checker() -> GroundingChecker {
        GroundingChecker::new(ToleranceConfig::default()).unwrap()
    }

    #[test]
    fn test_grounded_output_passes() {
        let window = window();
        let revenue = window
            .facts()
            .find(|f| f.predicate == "revenue")
            .unwrap()
            .clone();
        let marker = window.marker_for(&revenue.id).unwrap().to_string();

        let text = format!("Q3 revenue was $12M [{}].", marker);
        let report = checker().check(&text, &window, "Q3 revenue");
        assert!(report.is_grounded(), "{:?}", report.violations);
        assert_eq!(report.used, vec![revenue.id]);
    }

    #[test]
    fn test_conflicting_claim_is_a_violation() {
        let report = checker().check("Q3 revenue was $10M.", &window(), "Q3 revenue");
        assert!(!report.is_grounded());
        assert!(report.violations[0].contains("contradicts"));
    }

    #[test]
    fn test_unknown_marker_is_a_violation() {
        let report = checker().check("Revenue grew strongly [F9]", &window(), "Q3 revenue");
        assert!(report
            .violations
            .iter()
            .any(|v| v.contains("[F9]")));
    }

    #[test]
    fn test_unsupported_number_is_a_violation() {
        let report = checker().check("Headcount grew by 350 engineers", &window(), "Q3 revenue");
        assert!(report.violations.iter().any(|v| v.contains("350")));
    }

    #[test]
    fn test_quarter_labels_are_not_numbers() {
        let window = window();
        let margin = window
            .facts()
            .find(|f| f.predicate == "gross margin")
            .unwrap()
            .clone();
        let marker = window.marker_for(&margin.id).unwrap().to_string();

        let text = format!("Margins held at 41% in Q3 [{}]", marker);
        let report = checker().check(&text, &window, "Q3 revenue");
        assert!(report.is_grounded(), "{:?}", report.violations);
        assert_eq!(report.into_result().unwrap(), vec![margin.id]);
    }

    #[test]
    fn test_matching_value_on_other_predicate_is_unsupported() {
        let window = window();
        for text in ["Q3 profit was $12M.", "Our churn was $12M.", "Q4 revenue was $12M."] {
            let report = checker().check(text, &window, "Q3 revenue");
            assert!(!report.is_grounded(), "{} passed", text);
            assert!(
                report.violations.iter().any(|v| v.contains("unsupported claim")),
                "{}: {:?}",
                text,
                report.violations
            );
            assert!(report.used.is_empty());
        }
    }

    #[test]
    fn test_bare_predicate_resolves_to_topic() {
        let window = window();
        let report = checker().check("Revenue was $12M.", &window, "Q3 revenue");
        assert!(report.is_grounded(), "{:?}", report.violations);
        assert_eq!(report.used.len(), 1);

        let report = checker().check("Revenue was $15M.", &window, "Q3 revenue");
        assert!(report.violations.iter().any(|v| v.contains("contradicts")));
    }

    #[test]
    fn test_output_citing_no_fact_is_a_violation() {
        let report = checker().check(
            "Revenue doubled and margins hit record highs.",
            &window(),
            "Q3 revenue",
        );
        assert!(!report.is_grounded());
        assert!(matches!(
            report.into_result(),
            Err(ContextError::GroundingViolation { .. })
        ));
    }
}
