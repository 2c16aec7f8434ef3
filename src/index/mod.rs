//! Embedding index with dense, lexical and hybrid search

pub mod embedder;
pub mod expansion;
pub mod fusion;
pub mod lexical;
pub mod models;
pub mod store;

pub use embedder::{cosine, embedder_from_config, Embedder, EmbedderConfig, HashingEmbedder, HttpEmbedder};
pub use expansion::QueryExpander;
pub use fusion::FusionStrategy;
pub use lexical::{tokenize, Bm25Index, Bm25Params};
pub use models::{IndexConfig, IndexStats, RetrievalQuery, SearchHit, SearchMode};
pub use store::EmbeddingIndex;
