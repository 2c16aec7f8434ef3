//! Contradiction detection over grouped facts

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

use super::models::ContradictionRecord;
use super::policy::{ContradictionConfig, ResolutionPolicy};
use super::tolerance::ToleranceConfig;
use crate::error::Result;
use crate::facts::Fact;
use crate::metrics::METRICS;

/// Result of one detection pass
#[derive(Debug, Clone, Default)]
pub struct DetectionOutcome {
    /// Newly created records, already passed through the policy
    pub records: Vec<ContradictionRecord>,
}

impl DetectionOutcome {
    pub fn open(&self) -> impl Iterator<Item = &ContradictionRecord> {
        self.records.iter().filter(|r| r.is_open())
    }

    pub fn resolved(&self) -> impl Iterator<Item = &ContradictionRecord> {
        self.records.iter().filter(|r| !r.is_open())
    }
}

/// Groups facts by (entity, predicate) and compares each pair once
#[derive(Debug, Clone)]
pub struct ContradictionDetector {
    tolerance: ToleranceConfig,
    policy: ResolutionPolicy,
}

impl ContradictionDetector {
    pub fn new(config: &ContradictionConfig) -> Self {
        Self {
            tolerance: config.tolerance.clone(),
            policy: ResolutionPolicy::new(config),
        }
    }

    pub fn policy(&self) -> &ResolutionPolicy {
        &self.policy
    }

    /// Find conflicting pairs. Pairs present in `known` (any status) are
    /// skipped, so a second pass over the same facts creates nothing.
    pub fn detect(
        &self,
        facts: &[Fact],
        known: &HashSet<(String, String)>,
    ) -> Vec<ContradictionRecord> {
        let mut groups: BTreeMap<(&str, &str), Vec<&Fact>> = BTreeMap::new();
        let mut seen_ids = HashSet::new();
        for fact in facts {
            if seen_ids.insert(fact.id.as_str()) {
                groups.entry(fact.key()).or_default().push(fact);
            }
        }

        let mut records = Vec::new();
        for ((entity, predicate), mut group) in groups {
            if group.len() < 2 {
                continue;
            }
            group.sort_by(|a, b| a.id.cmp(&b.id));
            for (i, a) in group.iter().enumerate() {
                for b in &group[i + 1..] {
                    let pair = ContradictionRecord::pair_key(&a.id, &b.id);
                    if known.contains(&pair) {
                        continue;
                    }
                    if let Some(reason) = self.tolerance.conflict(&a.value, &b.value) {
                        debug!("Contradiction on ({}, {}): {}", entity, predicate, reason);
                        records.push(ContradictionRecord::new(a, b, reason));
                    }
                }
            }
        }

        records
    }

    /// Apply the policy to open records; returns how many were resolved
    pub fn resolve_all(
        &self,
        records: &mut [ContradictionRecord],
        facts: &HashMap<String, Fact>,
    ) -> Result<usize> {
        let mut resolved = 0;
        for record in records.iter_mut().filter(|r| r.is_open()) {
            let (Some(a), Some(b)) = (facts.get(&record.fact_a), facts.get(&record.fact_b)) else {
                continue;
            };
            if let Some(resolution) = self.policy.decide(record, a, b) {
                METRICS
                    .contradictions_resolved
                    .with_label_values(&[resolution.rule.to_string().as_str()])
                    .inc();
                record.resolve(resolution)?;
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Detect new contradictions and run them through the policy
    pub fn detect_and_resolve(
        &self,
        facts: &[Fact],
        known: &HashSet<(String, String)>,
    ) -> Result<DetectionOutcome> {
        let mut records = self.detect(facts, known);
        if records.is_empty() {
            return Ok(DetectionOutcome::default());
        }
        METRICS.contradictions_detected.inc_by(records.len() as f64);

        let by_id: HashMap<String, Fact> = facts.iter().map(|f| (f.id.clone(), f.clone())).collect();
        let resolved = self.resolve_all(&mut records, &by_id)?;
        info!(
            "Detected {} contradictions, {} resolved by policy",
            records.len(),
            resolved
        );
        Ok(DetectionOutcome { records })
    }
}

impl Default for ContradictionDetector {
    fn default() -> Self {
        Self::new(&ContradictionConfig::default())
    }
}
