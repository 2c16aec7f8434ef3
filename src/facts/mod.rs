//! Fact extraction
//!
//! Turns chunks into typed (entity, predicate, value) facts with a
//! confidence score and a reference to the chunk they came from.

pub mod extractor;
pub mod model_extractor;
pub mod models;
pub mod value;

pub use extractor::{split_sentences, FactExtractor, PatternExtractor, PATTERN_EXTRACTOR_VERSION};
pub use model_extractor::ModelExtractor;
pub use models::{normalize_key, ChunkRef, Fact, FactsConfig};
pub use value::{normalize_text, FactValue, ValueParser};
