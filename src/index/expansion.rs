//! Synonym-based query expansion, used once when retrieval comes back short

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::lexical::tokenize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryExpander {
    synonyms: BTreeMap<String, Vec<String>>,
}

impl Default for QueryExpander {
    fn default() -> Self {
        let table: &[(&str, &[&str])] = &[
            ("revenue", &["sales", "income", "turnover"]),
            ("profit", &["earnings", "margin"]),
            ("cost", &["expense", "spend"]),
            ("customers", &["clients", "users"]),
            ("growth", &["increase", "expansion"]),
            ("headcount", &["employees", "staff"]),
            ("roadmap", &["plan", "timeline", "milestones"]),
            ("launch", &["release", "rollout"]),
            ("risk", &["threat", "exposure"]),
        ];
        let synonyms = table
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect();
        Self { synonyms }
    }
}

impl QueryExpander {
    pub fn new(synonyms: BTreeMap<String, Vec<String>>) -> Self {
        Self { synonyms }
    }

    /// Merge extra entries, replacing existing keys
    pub fn with_synonyms(mut self, extra: BTreeMap<String, Vec<String>>) -> Self {
        self.synonyms.extend(extra);
        self
    }

    /// Query text with synonyms appended, or `None` when nothing applies
    pub fn expand(&self, text: &str) -> Option<String> {
        let terms = tokenize(text);
        let mut added: Vec<&str> = Vec::new();
        for term in &terms {
            if let Some(syns) = self.synonyms.get(term) {
                for s in syns {
                    if !terms.iter().any(|t| t == s) && !added.contains(&s.as_str()) {
                        added.push(s);
                    }
                }
            }
        }
        if added.is_empty() {
            None
        } else {
            Some(format!("{} {}", text.trim(), added.join(" ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expands_known_terms() {
        let expander = QueryExpander::default();
        let expanded = expander.expand("Product roadmap").unwrap();
        assert!(expanded.starts_with("Product roadmap"));
        assert!(expanded.contains("milestones"));
    }

    #[test]
    fn test_no_expansion_returns_none() {
        assert!(QueryExpander::default().expand("zebra").is_none());
    }
}
