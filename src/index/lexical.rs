//! BM25 inverted index

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "to", "was", "were", "with",
];

/// Lowercased alphanumeric terms, stopwords removed
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// BM25 tuning parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Inverted index over chunk text.
///
/// Postings are kept in ordered maps so scoring iterates in a stable order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bm25Index {
    params: Bm25Params,
    postings: BTreeMap<String, BTreeMap<String, u32>>,
    lengths: BTreeMap<String, usize>,
    total_length: usize,
}

impl Bm25Index {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.postings.len()
    }

    /// Add or replace a chunk's terms
    pub fn insert(&mut self, chunk_id: &str, text: &str) {
        self.remove(chunk_id);

        let terms = tokenize(text);
        let mut tf: HashMap<String, u32> = HashMap::new();
        for term in &terms {
            *tf.entry(term.clone()).or_default() += 1;
        }
        for (term, count) in tf {
            self.postings
                .entry(term)
                .or_default()
                .insert(chunk_id.to_string(), count);
        }

        self.total_length += terms.len();
        self.lengths.insert(chunk_id.to_string(), terms.len());
    }

    pub fn remove(&mut self, chunk_id: &str) {
        let Some(len) = self.lengths.remove(chunk_id) else {
            return;
        };
        self.total_length -= len;
        self.postings.retain(|_, docs| {
            docs.remove(chunk_id);
            !docs.is_empty()
        });
    }

    fn idf(&self, doc_freq: usize) -> f64 {
        let n = self.lengths.len() as f64;
        let df = doc_freq as f64;
        (1.0 + ((n - df + 0.5) / (df + 0.5)).max(0.0)).ln()
    }

    /// Score every chunk sharing at least one query term.
    ///
    /// Only positive scores are returned, ordered by score desc then chunk id.
    pub fn score(&self, query: &str) -> Vec<(String, f64)> {
        if self.is_empty() {
            return Vec::new();
        }

        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();

        let avg_len = self.total_length as f64 / self.lengths.len() as f64;
        let Bm25Params { k1, b } = self.params;
        let mut scores: BTreeMap<&str, f64> = BTreeMap::new();

        for term in &terms {
            let Some(docs) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(docs.len());
            for (chunk_id, tf) in docs {
                let len = self.lengths.get(chunk_id).copied().unwrap_or(0) as f64;
                let tf = *tf as f64;
                let norm = if avg_len > 0.0 {
                    1.0 - b + b * (len / avg_len)
                } else {
                    1.0
                };
                let s = idf * (tf * (k1 + 1.0)) / (tf + k1 * norm);
                *scores.entry(chunk_id.as_str()).or_default() += s;
            }
        }

        let mut ranked: Vec<(String, f64)> = scores
            .into_iter()
            .filter(|(_, s)| *s > 0.0)
            .map(|(id, s)| (id.to_string(), s))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_stopwords_and_punctuation() {
        assert_eq!(
            tokenize("The Q3 revenue, was $10M!"),
            vec!["q3", "revenue", "10m"]
        );
    }

    #[test]
    fn test_rare_term_outranks_common() {
        let mut idx = Bm25Index::new(Bm25Params::default());
        idx.insert("a", "revenue growth revenue");
        idx.insert("b", "revenue margin");
        idx.insert("c", "headcount plan");

        let ranked = idx.score("margin");
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].0, "b");

        let ranked = idx.score("revenue");
        assert_eq!(ranked[0].0, "a");
        assert!(ranked.iter().all(|(id, _)| id != "c"));
    }

    #[test]
    fn test_replace_and_remove() {
        let mut idx = Bm25Index::new(Bm25Params::default());
        idx.insert("a", "alpha beta");
        idx.insert("a", "gamma");
        assert!(idx.score("alpha").is_empty());
        assert_eq!(idx.len(), 1);

        idx.remove("a");
        assert!(idx.is_empty());
        assert_eq!(idx.vocabulary_size(), 0);
    }

    #[test]
    fn test_ties_break_on_id() {
        let mut idx = Bm25Index::new(Bm25Params::default());
        idx.insert("z", "roadmap");
        idx.insert("m", "roadmap");
        idx.insert("x", "other");
        let ranked = idx.score("roadmap");
        assert_eq!(ranked[0].0, "m");
        assert_eq!(ranked[1].0, "z");
    }
}
