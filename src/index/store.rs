//! In-memory hybrid embedding index

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use super::embedder::{cosine, Embedder};
use super::fusion::{fuse, WeightedList};
use super::lexical::{Bm25Index, Bm25Params};
use super::models::{IndexConfig, IndexStats, RetrievalQuery, SearchHit, SearchMode};
use crate::chunking::Chunk;
use crate::error::{ContextError, Result};
use crate::metrics::METRICS;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedChunk {
    chunk: Chunk,
    embedding: Vec<f32>,
}

struct IndexState {
    chunks: BTreeMap<String, IndexedChunk>,
    lexical: Bm25Index,
}

impl IndexState {
    fn insert(&mut self, entry: IndexedChunk) {
        self.lexical.insert(&entry.chunk.id, &entry.chunk.text);
        self.chunks.insert(entry.chunk.id.clone(), entry);
    }
}

/// On-disk MessagePack snapshot
#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    embedder: String,
    dimensions: usize,
    chunks: Vec<IndexedChunk>,
}

/// Chunk embeddings plus a BM25 inverted index.
///
/// Embeddings are computed before the write lock is taken, so concurrent
/// writers only serialize on the map insert. Searches take a read lock for
/// the scoring pass and see every write that completed before they started.
pub struct EmbeddingIndex {
    config: IndexConfig,
    embedder: Arc<dyn Embedder>,
    state: RwLock<IndexState>,
    query_cache: Cache<String, Arc<Vec<f32>>>,
}

impl EmbeddingIndex {
    pub fn new(config: IndexConfig, embedder: Arc<dyn Embedder>) -> Self {
        let lexical = Bm25Index::new(Bm25Params {
            k1: config.bm25_k1,
            b: config.bm25_b,
        });
        let query_cache = Cache::new(config.query_cache_capacity);
        Self {
            config,
            embedder,
            state: RwLock::new(IndexState {
                chunks: BTreeMap::new(),
                lexical,
            }),
            query_cache,
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    fn check_dimensions(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.embedder.dimensions() {
            return Err(ContextError::Embedding(format!(
                "embedding has {} dimensions, index expects {}",
                embedding.len(),
                self.embedder.dimensions()
            )));
        }
        Ok(())
    }

    /// Index one chunk. Re-indexing an existing id replaces it.
    pub async fn index(&self, chunk: Chunk) -> Result<()> {
        let embedding = self.embedder.embed(&chunk.text).await?;
        self.check_dimensions(&embedding)?;

        let mut state = self.state.write().await;
        state.insert(IndexedChunk { chunk, embedding });
        METRICS.chunks_indexed.inc();
        Ok(())
    }

    /// Index many chunks with one embedding call; all or nothing
    #[instrument(skip(self, chunks), fields(count = chunks.len()))]
    pub async fn index_batch(&self, chunks: Vec<Chunk>) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(ContextError::Embedding(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }
        for embedding in &embeddings {
            self.check_dimensions(embedding)?;
        }

        let count = chunks.len();
        let mut state = self.state.write().await;
        for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
            state.insert(IndexedChunk { chunk, embedding });
        }
        drop(state);

        METRICS.chunks_indexed.inc_by(count as f64);
        debug!("Indexed {} chunks", count);
        Ok(count)
    }

    async fn query_embedding(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        let key = text.trim().to_lowercase();
        if let Some(hit) = self.query_cache.get(&key).await {
            return Ok(hit);
        }
        let embedding = Arc::new(self.embedder.embed(text).await?);
        self.query_cache.insert(key, embedding.clone()).await;
        Ok(embedding)
    }

    /// Ranked search. An empty index, empty query or `top_k == 0` yields no hits.
    pub async fn search(&self, query: &RetrievalQuery) -> Result<Vec<SearchHit>> {
        let started = Instant::now();
        if query.top_k == 0 || query.text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = if query.mode.uses_dense() {
            Some(self.query_embedding(&query.text).await?)
        } else {
            None
        };

        let state = self.state.read().await;
        if state.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let dense: Vec<(String, f64)> = match &query_vec {
            Some(qv) => {
                let mut scored: Vec<(String, f64)> = state
                    .chunks
                    .values()
                    .map(|entry| (entry.chunk.id.clone(), cosine(qv, &entry.embedding)))
                    .filter(|(_, s)| *s >= self.config.min_dense_score)
                    .collect();
                scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                scored
            }
            None => Vec::new(),
        };

        let lexical = if query.mode.uses_lexical() {
            state.lexical.score(&query.text)
        } else {
            Vec::new()
        };

        let ranked: Vec<(String, f64)> = match query.mode {
            SearchMode::Dense => dense.clone(),
            SearchMode::Lexical => lexical.clone(),
            SearchMode::Hybrid => fuse(
                self.config.fusion,
                &[
                    WeightedList {
                        weight: self.config.dense_weight,
                        ranked: &dense,
                    },
                    WeightedList {
                        weight: self.config.lexical_weight,
                        ranked: &lexical,
                    },
                ],
            ),
        };

        let dense_scores: BTreeMap<&str, f64> =
            dense.iter().map(|(id, s)| (id.as_str(), *s)).collect();
        let lexical_scores: BTreeMap<&str, f64> =
            lexical.iter().map(|(id, s)| (id.as_str(), *s)).collect();

        let hits: Vec<SearchHit> = ranked
            .into_iter()
            .take(query.top_k)
            .filter_map(|(id, score)| {
                state.chunks.get(&id).map(|entry| SearchHit {
                    chunk: entry.chunk.clone(),
                    score,
                    dense_score: dense_scores.get(id.as_str()).copied(),
                    lexical_score: lexical_scores.get(id.as_str()).copied(),
                })
            })
            .collect();

        METRICS.record_retrieval(query.mode, started.elapsed().as_secs_f64());
        debug!(
            "Search '{}' ({:?}) returned {} hits",
            query.text,
            query.mode,
            hits.len()
        );
        Ok(hits)
    }

    pub async fn get(&self, chunk_id: &str) -> Option<Chunk> {
        self.state
            .read()
            .await
            .chunks
            .get(chunk_id)
            .map(|e| e.chunk.clone())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.chunks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.chunks.is_empty()
    }

    pub async fn stats(&self) -> IndexStats {
        let state = self.state.read().await;
        let documents: BTreeSet<&str> = state
            .chunks
            .values()
            .map(|e| e.chunk.document_id.as_str())
            .collect();
        IndexStats {
            chunks: state.chunks.len(),
            documents: documents.len(),
            vocabulary: state.lexical.vocabulary_size(),
            dimensions: self.embedder.dimensions(),
            embedder: self.embedder.name().to_string(),
        }
    }

    /// Write a MessagePack snapshot of chunks and embeddings
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let state = self.state.read().await;
            IndexSnapshot {
                embedder: self.embedder.name().to_string(),
                dimensions: self.embedder.dimensions(),
                chunks: state.chunks.values().cloned().collect(),
            }
        };
        let bytes = rmp_serde::to_vec_named(&snapshot)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;

        info!(
            "Saved index snapshot with {} chunks to {}",
            snapshot.chunks.len(),
            path.display()
        );
        Ok(())
    }

    /// Rebuild an index from a snapshot; the lexical index is recomputed
    pub async fn load_snapshot(
        path: &Path,
        config: IndexConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: IndexSnapshot = rmp_serde::from_slice(&bytes)?;

        if snapshot.dimensions != embedder.dimensions() || snapshot.embedder != embedder.name() {
            return Err(ContextError::Storage(format!(
                "snapshot was built with {} ({} dims), current embedder is {} ({} dims)",
                snapshot.embedder,
                snapshot.dimensions,
                embedder.name(),
                embedder.dimensions()
            )));
        }

        let index = Self::new(config, embedder);
        {
            let mut state = index.state.write().await;
            for entry in snapshot.chunks {
                state.insert(entry);
            }
        }
        info!(
            "Loaded index snapshot with {} chunks from {}",
            index.len().await,
            path.display()
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{SourceInfo, TextRange};
    use crate::index::embedder::HashingEmbedder;

    fn chunk(doc: &str, ordinal: usize, text: &str) -> Chunk {
        Chunk {
            id: Chunk::make_id(doc, ordinal),
            document_id: doc.to_string(),
            ordinal,
            range: TextRange::new(0, text.len()),
            text: text.to_string(),
            token_count: text.split_whitespace().count(),
            source: SourceInfo {
                document_id: doc.to_string(),
                title: doc.to_string(),
                provenance: "web".to_string(),
                published_at: None,
            },
        }
    }

    fn index() -> EmbeddingIndex {
        EmbeddingIndex::new(IndexConfig::default(), Arc::new(HashingEmbedder::new(256)))
    }

    #[tokio::test]
    async fn test_empty_index_returns_nothing() {
        let idx = index();
        let hits = idx.search(&RetrievalQuery::new("revenue", 5)).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_lexical_search_finds_term() {
        let idx = index();
        idx.index_batch(vec![
            chunk("a", 0, "Q3 revenue reached $10M"),
            chunk("b", 0, "Hiring plan for engineering"),
        ])
        .await
        .unwrap();

        let hits = idx
            .search(&RetrievalQuery::new("revenue", 5).with_mode(SearchMode::Lexical))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.document_id, "a");
        assert!(hits[0].lexical_score.is_some());
    }

    #[tokio::test]
    async fn test_hybrid_is_deterministic() {
        let idx = index();
        idx.index_batch(vec![
            chunk("a", 0, "revenue revenue growth"),
            chunk("a", 1, "revenue margin"),
            chunk("b", 0, "revenue outlook"),
            chunk("c", 0, "unrelated text about weather"),
        ])
        .await
        .unwrap();

        let q = RetrievalQuery::new("revenue growth", 3);
        let first: Vec<String> = idx
            .search(&q)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.chunk.id)
            .collect();
        for _ in 0..5 {
            let again: Vec<String> = idx
                .search(&q)
                .await
                .unwrap()
                .into_iter()
                .map(|h| h.chunk.id)
                .collect();
            assert_eq!(first, again);
        }
        assert_eq!(first[0], "a#0000");
    }

    #[tokio::test]
    async fn test_top_k_zero() {
        let idx = index();
        idx.index(chunk("a", 0, "revenue")).await.unwrap();
        assert!(idx.search(&RetrievalQuery::new("revenue", 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reindex_replaces() {
        let idx = index();
        idx.index(chunk("a", 0, "alpha")).await.unwrap();
        idx.index(chunk("a", 0, "beta")).await.unwrap();
        assert_eq!(idx.len().await, 1);
        assert_eq!(idx.get("a#0000").await.unwrap().text, "beta");
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_preserves_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.msgpack");

        let idx = index();
        idx.index_batch(vec![
            chunk("a", 0, "revenue growth in Q3"),
            chunk("b", 0, "customer churn fell"),
        ])
        .await
        .unwrap();
        idx.save_snapshot(&path).await.unwrap();

        let loaded = EmbeddingIndex::load_snapshot(
            &path,
            IndexConfig::default(),
            Arc::new(HashingEmbedder::new(256)),
        )
        .await
        .unwrap();

        let q = RetrievalQuery::new("customer churn", 2);
        let before: Vec<_> = idx.search(&q).await.unwrap().into_iter().map(|h| h.chunk.id).collect();
        let after: Vec<_> = loaded.search(&q).await.unwrap().into_iter().map(|h| h.chunk.id).collect();
        assert_eq!(before, after);

        let stats = loaded.stats().await;
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.dimensions, 256);
    }

    #[tokio::test]
    async fn test_snapshot_rejects_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.msgpack");
        let idx = index();
        idx.index(chunk("a", 0, "revenue")).await.unwrap();
        idx.save_snapshot(&path).await.unwrap();

        let result = EmbeddingIndex::load_snapshot(
            &path,
            IndexConfig::default(),
            Arc::new(HashingEmbedder::new(64)),
        )
        .await;
        assert!(matches!(result, Err(ContextError::Storage(_))));
    }
}
