//! Document chunking
//!
//! Splits ingested documents into bounded, overlapping chunks while keeping
//! protected structural units (table rows, code fences) intact and every
//! byte of the source covered.

pub mod models;
pub mod structure;
pub mod chunker;

pub use models::{
    Chunk, Document, DocumentMetadata, ProvenanceSpan, SourceInfo, StructuralKind,
    StructuralUnit, TextRange,
};
pub use structure::{detect_markdown_structure, validate_document};
pub use chunker::{ChunkOutcome, ChunkStrategy, Chunker, ChunkingConfig};
