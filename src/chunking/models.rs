//! Document and chunk data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Byte range into a document's text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "TextRange: start must be <= end");
        TextRange { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Extract the text slice from a source string
    pub fn slice<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }

    pub fn contains(&self, other: &TextRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// True if `offset` lies strictly inside the range (a cut there would split it)
    pub fn splits_at(&self, offset: usize) -> bool {
        self.start < offset && offset < self.end
    }

    pub fn overlaps(&self, other: &TextRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl From<Range<usize>> for TextRange {
    fn from(range: Range<usize>) -> Self {
        TextRange::new(range.start, range.end)
    }
}

/// Kind of structural unit found in a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralKind {
    TableRow,
    CodeBlock,
    Heading,
}

/// A unit that must never be split across chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralUnit {
    pub kind: StructuralKind,
    pub range: TextRange,
}

impl StructuralUnit {
    pub fn new(kind: StructuralKind, range: TextRange) -> Self {
        Self { kind, range }
    }
}

/// Attributes a passage of a document to a specific source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceSpan {
    pub range: TextRange,
    pub provenance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// Source metadata attached at ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: String,
    /// Provenance label, ranked by the contradiction trust table
    pub provenance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Explicit structural units; when empty, Markdown detection may fill them in
    #[serde(default)]
    pub structure: Vec<StructuralUnit>,
    #[serde(default)]
    pub provenance_spans: Vec<ProvenanceSpan>,
}

impl DocumentMetadata {
    pub fn new(title: impl Into<String>, provenance: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            provenance: provenance.into(),
            published_at: None,
            structure: Vec::new(),
            provenance_spans: Vec::new(),
        }
    }

    pub fn with_published_at(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    pub fn with_structure(mut self, units: Vec<StructuralUnit>) -> Self {
        self.structure = units;
        self
    }

    pub fn with_provenance_span(
        mut self,
        range: TextRange,
        provenance: impl Into<String>,
        published_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.provenance_spans.push(ProvenanceSpan {
            range,
            provenance: provenance.into(),
            published_at,
        });
        self
    }
}

/// An ingested source document. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: DocumentMetadata,
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>, metadata: DocumentMetadata) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata,
            ingested_at: Utc::now(),
        }
    }
}

/// Provenance copied onto each chunk so facts can be ranked without the document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub document_id: String,
    pub title: String,
    pub provenance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// Contiguous unit of document text used for retrieval and extraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub range: TextRange,
    pub text: String,
    pub token_count: usize,
    pub source: SourceInfo,
}

impl Chunk {
    /// Stable chunk id derived from document id and position
    pub fn make_id(document_id: &str, ordinal: usize) -> String {
        format!("{}#{:04}", document_id, ordinal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_range_helpers() {
        let r = TextRange::new(2, 6);
        assert_eq!(r.len(), 4);
        assert_eq!(r.slice("abcdefgh"), "cdef");
        assert!(r.splits_at(3));
        assert!(!r.splits_at(2));
        assert!(!r.splits_at(6));
        assert!(r.overlaps(&TextRange::new(5, 9)));
        assert!(!r.overlaps(&TextRange::new(6, 9)));
    }

    #[test]
    fn test_chunk_ids_sort_by_position() {
        let a = Chunk::make_id("deck", 2);
        let b = Chunk::make_id("deck", 10);
        assert_eq!(a, "deck#0002");
        assert!(a < b);
    }
}
