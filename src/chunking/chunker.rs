//! Document chunker
//!
//! Splits a document into bounded, overlapping chunks:
//! 1. Hard cut points (provenance span edges, headings for `Structured`)
//!    divide the text into regions; chunks never cross a region edge.
//! 2. Each region is cut into atoms. Protected units are atoms of their own;
//!    the gaps between them are split recursively on the separator list.
//! 3. Atoms are packed greedily up to `max_tokens`; the next chunk re-starts
//!    far enough back to carry up to `overlap_tokens` of context.
//!
//! Consecutive chunks always touch or overlap, so every byte of the
//! document belongs to at least one chunk.

use super::models::{Chunk, Document, SourceInfo, StructuralKind, StructuralUnit, TextRange};
use super::structure::{detect_markdown_structure, validate_document};
use crate::context::{estimator_from_name, TokenEstimator};
use crate::error::{ContextError, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Splitting strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// Word windows of `max_tokens` with `overlap_tokens` overlap
    FixedSize,
    /// Recursive separator splitting (paragraph, line, word, character)
    Recursive,
    /// Recursive splitting where every heading starts a new chunk
    Structured,
}

/// Chunker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: ChunkStrategy,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,

    /// Separators for recursive splitting, coarsest first. "" means characters.
    #[serde(default = "default_separators")]
    pub separators: Vec<String>,

    /// Token estimator name ("word" or "tiktoken")
    #[serde(default = "default_estimator")]
    pub estimator: String,

    /// Detect Markdown tables, code fences and headings when no explicit structure is given
    #[serde(default = "default_detect_markdown")]
    pub detect_markdown: bool,

    /// Documents chunked concurrently during batch ingestion
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_strategy() -> ChunkStrategy {
    ChunkStrategy::Structured
}

fn default_max_tokens() -> usize {
    256
}

fn default_overlap_tokens() -> usize {
    26
}

fn default_separators() -> Vec<String> {
    vec!["\n\n".to_string(), "\n".to_string(), " ".to_string(), String::new()]
}

fn default_estimator() -> String {
    "word".to_string()
}

fn default_detect_markdown() -> bool {
    true
}

fn default_concurrency() -> usize {
    8
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
            separators: default_separators(),
            estimator: default_estimator(),
            detect_markdown: default_detect_markdown(),
            concurrency: default_concurrency(),
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(ContextError::Configuration(
                "chunking.max_tokens must be positive".to_string(),
            ));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(ContextError::Configuration(format!(
                "chunking.overlap_tokens ({}) must be smaller than max_tokens ({})",
                self.overlap_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}

/// Outcome of chunking one document in a batch
#[derive(Debug)]
pub struct ChunkOutcome {
    pub document_id: String,
    pub result: Result<Vec<Chunk>>,
}

/// Document chunker
#[derive(Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl Chunker {
    pub fn new(config: ChunkingConfig, estimator: Arc<dyn TokenEstimator>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, estimator })
    }

    /// Build with the estimator named in the configuration
    pub fn from_config(config: ChunkingConfig) -> Result<Self> {
        let estimator = estimator_from_name(&config.estimator)?;
        Self::new(config, estimator)
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split a document into chunks.
    ///
    /// Empty or malformed documents yield `ContextError::Ingestion`.
    pub fn chunk(&self, doc: &Document) -> Result<Vec<Chunk>> {
        if doc.text.trim().is_empty() {
            return Err(ContextError::Ingestion {
                doc_id: doc.id.clone(),
                reason: "document has no text content".to_string(),
            });
        }
        validate_document(doc)?;

        let text = doc.text.as_str();
        let units = if doc.metadata.structure.is_empty() && self.config.detect_markdown {
            detect_markdown_structure(text)
        } else {
            doc.metadata.structure.clone()
        };

        let mut ranges = Vec::new();
        for region in self.regions(doc, &units) {
            let atoms = self.atoms(text, region, &units);
            ranges.extend(self.pack(text, &atoms));
        }
        let ranges = absorb_blank_ranges(text, ranges);

        let chunks: Vec<Chunk> = ranges
            .into_iter()
            .enumerate()
            .map(|(ordinal, range)| {
                let slice = range.slice(text);
                Chunk {
                    id: Chunk::make_id(&doc.id, ordinal),
                    document_id: doc.id.clone(),
                    ordinal,
                    range,
                    text: slice.to_string(),
                    token_count: self.estimator.estimate(slice),
                    source: source_for(doc, range),
                }
            })
            .collect();

        debug!(
            "Chunked document {} ({} bytes) into {} chunks",
            doc.id,
            text.len(),
            chunks.len()
        );

        Ok(chunks)
    }

    /// Chunk many documents concurrently, preserving input order.
    ///
    /// A failing document is reported in its outcome; the others continue.
    pub async fn chunk_all(&self, docs: Vec<Document>) -> Vec<ChunkOutcome> {
        let concurrency = self.config.concurrency.max(1);

        let outcomes: Vec<ChunkOutcome> = stream::iter(docs)
            .map(|doc| {
                let chunker = self.clone();
                async move {
                    let document_id = doc.id.clone();
                    let result = tokio::task::spawn_blocking(move || chunker.chunk(&doc))
                        .await
                        .unwrap_or_else(|e| {
                            Err(ContextError::Internal(format!("chunking task failed: {}", e)))
                        });
                    if let Err(e) = &result {
                        warn!("Skipping document {}: {}", document_id, e);
                    }
                    ChunkOutcome { document_id, result }
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        info!(
            "Chunked {} documents ({} failed)",
            outcomes.len(),
            outcomes.iter().filter(|o| o.result.is_err()).count()
        );

        outcomes
    }

    /// Regions bounded by hard cut points
    fn regions(&self, doc: &Document, units: &[StructuralUnit]) -> Vec<TextRange> {
        let len = doc.text.len();
        let mut cuts: Vec<usize> = doc
            .metadata
            .provenance_spans
            .iter()
            .flat_map(|s| [s.range.start, s.range.end])
            .collect();

        if self.config.strategy == ChunkStrategy::Structured {
            cuts.extend(
                units
                    .iter()
                    .filter(|u| u.kind == StructuralKind::Heading)
                    .map(|u| u.range.start),
            );
        }

        // a protected unit wins over any cut that would split it
        cuts.retain(|&c| c > 0 && c < len && !units.iter().any(|u| u.range.splits_at(c)));
        cuts.sort_unstable();
        cuts.dedup();

        let mut regions = Vec::with_capacity(cuts.len() + 1);
        let mut start = 0;
        for cut in cuts {
            regions.push(TextRange::new(start, cut));
            start = cut;
        }
        regions.push(TextRange::new(start, len));
        regions
    }

    /// Contiguous atoms covering `region`
    fn atoms(&self, text: &str, region: TextRange, units: &[StructuralUnit]) -> Vec<TextRange> {
        let mut protected: Vec<TextRange> = units
            .iter()
            .map(|u| u.range)
            .filter(|r| !r.is_empty() && region.contains(r))
            .collect();
        protected.sort();

        let separators: Vec<String> = match self.config.strategy {
            ChunkStrategy::FixedSize => vec![" ".to_string(), String::new()],
            _ => self.config.separators.clone(),
        };

        let mut atoms = Vec::new();
        let mut cursor = region.start;
        for unit in protected {
            if unit.start < cursor {
                // nested or overlapping unit already covered
                continue;
            }
            if unit.start > cursor {
                self.split_recursive(text, TextRange::new(cursor, unit.start), &separators, &mut atoms);
            }
            atoms.push(unit);
            cursor = unit.end;
        }
        if cursor < region.end {
            self.split_recursive(text, TextRange::new(cursor, region.end), &separators, &mut atoms);
        }
        atoms
    }

    fn split_recursive(
        &self,
        text: &str,
        range: TextRange,
        separators: &[String],
        out: &mut Vec<TextRange>,
    ) {
        let slice = range.slice(text);
        if self.estimator.estimate(slice) <= self.config.max_tokens {
            out.push(range);
            return;
        }

        let Some((sep, rest)) = separators.split_first() else {
            out.push(range);
            return;
        };

        if sep.is_empty() {
            self.split_chars(text, range, out);
            return;
        }

        let pieces = split_keeping_separator(slice, sep, range.start);
        if pieces.len() <= 1 {
            self.split_recursive(text, range, rest, out);
            return;
        }

        for piece in pieces {
            if self.estimator.estimate(piece.slice(text)) > self.config.max_tokens {
                self.split_recursive(text, piece, rest, out);
            } else {
                out.push(piece);
            }
        }
    }

    /// Last resort: fixed character windows (about four characters per token)
    fn split_chars(&self, text: &str, range: TextRange, out: &mut Vec<TextRange>) {
        let window = (self.config.max_tokens * 4).max(1);
        let slice = range.slice(text);
        let mut start = range.start;
        let mut count = 0;

        for (idx, _) in slice.char_indices() {
            if count == window {
                let cut = range.start + idx;
                out.push(TextRange::new(start, cut));
                start = cut;
                count = 0;
            }
            count += 1;
        }
        if start < range.end {
            out.push(TextRange::new(start, range.end));
        }
    }

    /// Greedy packing with token overlap
    fn pack(&self, text: &str, atoms: &[TextRange]) -> Vec<TextRange> {
        let tokens: Vec<usize> = atoms
            .iter()
            .map(|a| self.estimator.estimate(a.slice(text)))
            .collect();

        let mut ranges = Vec::new();
        let mut start_idx = 0;

        while start_idx < atoms.len() {
            let mut end_idx = start_idx;
            let mut used = 0;
            while end_idx < atoms.len() {
                let t = tokens[end_idx];
                if end_idx > start_idx && used + t > self.config.max_tokens {
                    break;
                }
                used += t;
                end_idx += 1;
            }

            ranges.push(TextRange::new(atoms[start_idx].start, atoms[end_idx - 1].end));
            if end_idx >= atoms.len() {
                break;
            }

            let mut next = end_idx;
            let mut carried = 0;
            while next > start_idx + 1 {
                let t = tokens[next - 1];
                if carried + t > self.config.overlap_tokens {
                    break;
                }
                carried += t;
                next -= 1;
            }
            start_idx = next;
        }

        ranges
    }
}

/// Split `slice` after each occurrence of `sep`; offsets are absolute
fn split_keeping_separator(slice: &str, sep: &str, base: usize) -> Vec<TextRange> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in slice.match_indices(sep) {
        let end = idx + sep.len();
        if end > start {
            pieces.push(TextRange::new(base + start, base + end));
            start = end;
        }
    }
    if start < slice.len() {
        pieces.push(TextRange::new(base + start, base + slice.len()));
    }
    pieces
}

/// Fold whitespace-only ranges into a neighbour so no chunk is blank
fn absorb_blank_ranges(text: &str, ranges: Vec<TextRange>) -> Vec<TextRange> {
    let mut out: Vec<TextRange> = Vec::with_capacity(ranges.len());
    let mut pending_start: Option<usize> = None;

    for mut range in ranges {
        if range.slice(text).trim().is_empty() {
            match out.last_mut() {
                Some(last) => last.end = last.end.max(range.end),
                None => {
                    pending_start.get_or_insert(range.start);
                }
            }
            continue;
        }
        if let Some(start) = pending_start.take() {
            range.start = range.start.min(start);
        }
        out.push(range);
    }

    out
}

fn source_for(doc: &Document, range: TextRange) -> SourceInfo {
    let span = doc
        .metadata
        .provenance_spans
        .iter()
        .find(|s| s.range.start <= range.start && range.start < s.range.end);

    SourceInfo {
        document_id: doc.id.clone(),
        title: doc.metadata.title.clone(),
        provenance: span
            .map(|s| s.provenance.clone())
            .unwrap_or_else(|| doc.metadata.provenance.clone()),
        published_at: span
            .and_then(|s| s.published_at)
            .or(doc.metadata.published_at),
    }
}
