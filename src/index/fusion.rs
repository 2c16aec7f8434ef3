//! Score fusion for hybrid search
//!
//! Both strategies return `(chunk_id, fused_score)` ordered by score desc,
//! ties broken by chunk id ascending.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How dense and lexical rankings are combined
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FusionStrategy {
    /// score = Σ w_i / (k + rank_i), ranks starting at 1
    ReciprocalRank { k: u32 },
    /// Each list min-max normalized to [0, 1], then weighted sum
    WeightedMinMax,
}

impl Default for FusionStrategy {
    fn default() -> Self {
        FusionStrategy::ReciprocalRank { k: 60 }
    }
}

/// A ranked list with its fusion weight. Must already be sorted.
pub struct WeightedList<'a> {
    pub weight: f64,
    pub ranked: &'a [(String, f64)],
}

pub fn fuse(strategy: FusionStrategy, lists: &[WeightedList<'_>]) -> Vec<(String, f64)> {
    let scores = match strategy {
        FusionStrategy::ReciprocalRank { k } => reciprocal_rank(lists, k),
        FusionStrategy::WeightedMinMax => weighted_min_max(lists),
    };
    let mut fused: Vec<(String, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    fused
}

fn reciprocal_rank(lists: &[WeightedList<'_>], k: u32) -> BTreeMap<String, f64> {
    let mut scores = BTreeMap::new();
    for list in lists {
        for (rank, (id, _)) in list.ranked.iter().enumerate() {
            let rrf = list.weight / (k as f64 + (rank + 1) as f64);
            *scores.entry(id.clone()).or_insert(0.0) += rrf;
        }
    }
    scores
}

fn weighted_min_max(lists: &[WeightedList<'_>]) -> BTreeMap<String, f64> {
    let mut scores = BTreeMap::new();
    for list in lists {
        if list.ranked.is_empty() {
            continue;
        }
        let (min, max) = list
            .ranked
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, s)| {
                (lo.min(*s), hi.max(*s))
            });
        let span = max - min;
        for (id, s) in list.ranked {
            // a single-valued list carries full signal
            let norm = if span > f64::EPSILON { (s - min) / span } else { 1.0 };
            *scores.entry(id.clone()).or_insert(0.0) += list.weight * norm;
        }
    }
    scores
}
