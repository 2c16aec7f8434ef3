//! Fact window assembly for model prompts

use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::context::TokenBudgetManager;
use crate::facts::Fact;

/// A fact placed in the prompt under a citation marker
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEntry {
    /// `F1`, `F2`, ...
    pub marker: String,
    pub fact: Fact,
    pub tokens: usize,
}

/// Facts supplied to the model, highest priority first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactWindow {
    entries: Vec<WindowEntry>,
    tokens_used: usize,
    dropped: usize,
}

/// Facts the window may contain: attributed and not low-confidence
pub fn is_window_eligible(fact: &Fact) -> bool {
    fact.is_attributed() && !fact.low_confidence
}

/// Confidence desc, then source timestamp desc, then observation time
/// desc, then id
pub fn window_order(a: &Fact, b: &Fact) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.source_published_at.cmp(&a.source_published_at))
        .then_with(|| b.observed_at.cmp(&a.observed_at))
        .then_with(|| a.id.cmp(&b.id))
}

impl FactWindow {
    /// Order eligible facts and take them until `budget_tokens` is spent.
    ///
    /// Filling stops at the first fact that does not fit, so a lower-priority
    /// fact never displaces a higher one.
    pub fn assemble(facts: Vec<Fact>, budget_tokens: usize, budget: &TokenBudgetManager) -> Self {
        let mut eligible: Vec<Fact> = facts.into_iter().filter(is_window_eligible).collect();
        eligible.sort_by(window_order);
        eligible.dedup_by(|a, b| a.id == b.id);

        let mut window = FactWindow::default();
        let total = eligible.len();
        for fact in eligible {
            let marker = format!("F{}", window.entries.len() + 1);
            let tokens = budget.estimate_tokens(&render_line(&marker, &fact));
            if window.tokens_used + tokens > budget_tokens {
                break;
            }
            window.tokens_used += tokens;
            window.entries.push(WindowEntry {
                marker,
                fact,
                tokens,
            });
        }
        window.dropped = total - window.entries.len();
        window
    }

    pub fn entries(&self) -> &[WindowEntry] {
        &self.entries
    }

    pub fn facts(&self) -> impl Iterator<Item = &Fact> {
        self.entries.iter().map(|e| &e.fact)
    }

    pub fn by_marker(&self, marker: &str) -> Option<&WindowEntry> {
        self.entries.iter().find(|e| e.marker == marker)
    }

    pub fn marker_for(&self, fact_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.fact.id == fact_id)
            .map(|e| e.marker.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tokens_used(&self) -> usize {
        self.tokens_used
    }

    /// Eligible facts that did not fit
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// One line per fact, as sent to the model
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let _ = writeln!(out, "{}", render_line(&entry.marker, &entry.fact));
        }
        out
    }
}

fn render_line(marker: &str, fact: &Fact) -> String {
    let chunk = fact
        .primary_chunk()
        .map(|c| c.chunk_id.as_str())
        .unwrap_or("-");
    format!(
        "[{}] {} (source: {}, chunk {})",
        marker,
        fact.statement(),
        fact.provenance,
        chunk
    )
}
