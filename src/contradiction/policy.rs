//! Ordered resolution rules

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::models::{ContradictionRecord, Resolution, ResolutionRule};
use super::tolerance::ToleranceConfig;
use crate::facts::Fact;

/// Contradiction detection and resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContradictionConfig {
    #[serde(default)]
    pub tolerance: ToleranceConfig,

    /// Provenance labels, most trusted first. Unlisted sources rank last.
    #[serde(default = "default_trust_ranking")]
    pub trust_ranking: Vec<String>,

    /// Confidence gap that counts as a decisive difference
    #[serde(default = "default_confidence_epsilon")]
    pub confidence_epsilon: f32,

    /// Rules tried in order until one decides
    #[serde(default = "default_rules")]
    pub rules: Vec<ResolutionRule>,
}

fn default_trust_ranking() -> Vec<String> {
    vec![
        "audited_report".to_string(),
        "financial_statement".to_string(),
        "press_release".to_string(),
        "internal_memo".to_string(),
        "web".to_string(),
    ]
}

fn default_confidence_epsilon() -> f32 {
    0.05
}

fn default_rules() -> Vec<ResolutionRule> {
    vec![
        ResolutionRule::SourceTrust,
        ResolutionRule::Confidence,
        ResolutionRule::Recency,
    ]
}

impl Default for ContradictionConfig {
    fn default() -> Self {
        Self {
            tolerance: ToleranceConfig::default(),
            trust_ranking: default_trust_ranking(),
            confidence_epsilon: default_confidence_epsilon(),
            rules: default_rules(),
        }
    }
}

impl ContradictionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.rules.contains(&ResolutionRule::Escalation) {
            return Err("escalation is not a policy rule".to_string());
        }
        if self.confidence_epsilon < 0.0 {
            return Err("confidence_epsilon must be non-negative".to_string());
        }
        self.tolerance.validate()
    }
}

/// Explicit rule table: source trust, then confidence, then recency.
/// A pair no rule separates stays open.
#[derive(Debug, Clone)]
pub struct ResolutionPolicy {
    rules: Vec<ResolutionRule>,
    trust_ranking: Vec<String>,
    confidence_epsilon: f32,
}

impl ResolutionPolicy {
    pub fn new(config: &ContradictionConfig) -> Self {
        Self {
            rules: config.rules.clone(),
            trust_ranking: config
                .trust_ranking
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            confidence_epsilon: config.confidence_epsilon,
        }
    }

    /// 0 is most trusted; unknown provenance ranks after every listed one
    pub fn trust_rank(&self, provenance: &str) -> usize {
        let p = provenance.to_lowercase();
        self.trust_ranking
            .iter()
            .position(|t| *t == p)
            .unwrap_or(self.trust_ranking.len())
    }

    /// Ordering of `a` against `b` under one rule; `Greater` means `a` wins
    fn compare(&self, rule: ResolutionRule, a: &Fact, b: &Fact) -> Option<(Ordering, String)> {
        match rule {
            ResolutionRule::SourceTrust => {
                let (ra, rb) = (self.trust_rank(&a.provenance), self.trust_rank(&b.provenance));
                match rb.cmp(&ra) {
                    Ordering::Equal => None,
                    ord => {
                        let (win, lose) = if ord == Ordering::Greater { (a, b) } else { (b, a) };
                        Some((
                            ord,
                            format!(
                                "source '{}' is more trusted than '{}'",
                                win.provenance, lose.provenance
                            ),
                        ))
                    }
                }
            }
            ResolutionRule::Confidence => {
                if (a.confidence - b.confidence).abs() <= self.confidence_epsilon {
                    return None;
                }
                let ord = a.confidence.total_cmp(&b.confidence);
                let (win, lose) = if ord == Ordering::Greater { (a, b) } else { (b, a) };
                Some((
                    ord,
                    format!(
                        "confidence {:.2} exceeds {:.2}",
                        win.confidence, lose.confidence
                    ),
                ))
            }
            ResolutionRule::Recency => {
                let (ta, tb) = (a.source_published_at?, b.source_published_at?);
                match ta.cmp(&tb) {
                    Ordering::Equal => None,
                    ord => {
                        let (win, lose) = if ord == Ordering::Greater { (ta, tb) } else { (tb, ta) };
                        Some((
                            ord,
                            format!("source dated {} is newer than {}", win.date_naive(), lose.date_naive()),
                        ))
                    }
                }
            }
            ResolutionRule::Escalation => None,
        }
    }

    /// First rule that separates the two facts, if any
    pub fn decide(&self, record: &ContradictionRecord, a: &Fact, b: &Fact) -> Option<Resolution> {
        for rule in &self.rules {
            if let Some((ord, rationale)) = self.compare(*rule, a, b) {
                let winner = if ord == Ordering::Greater { a } else { b };
                let status = record.status_keeping(&winner.id)?;
                return Some(Resolution {
                    status,
                    rule: *rule,
                    rationale,
                });
            }
        }
        None
    }
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self::new(&ContradictionConfig::default())
    }
}
