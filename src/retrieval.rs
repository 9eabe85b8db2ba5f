//! Knowledge-base retrieval: vector search with a keyword fallback.
//!
//! ```text
//! query ──▶ every ready chunk embedded? ──no──────────────┐
//!              │ yes                                      │
//!              ▼                                          ▼
//!          embed query, cosine-score all vectors     FTS keyword search
//!              │ error or zero hits ─────────────────────▶│
//!              ▼                                          ▼
//!          top `limit` by similarity                 top `limit` by rank
//! ```
//!
//! Callers never learn which path answered.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::embedding::cosine_similarity;
use crate::models::ScoredChunk;
use crate::provider::ChatProvider;
use crate::store::Store;

pub struct Retriever {
    store: Arc<dyn Store>,
    provider: Arc<dyn ChatProvider>,
}

impl Retriever {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn ChatProvider>) -> Self {
        Self { store, provider }
    }

    /// Ranked chunks for `query`, best first, at most `limit`.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let model = self.provider.embedding_model();
        let unembedded = self.store.count_unembedded_ready_chunks(model).await?;
        if unembedded == 0 {
            match self.vector_search(query, limit).await {
                Ok(hits) if !hits.is_empty() => return Ok(hits),
                Ok(_) => debug!("vector search returned nothing, using keyword search"),
                Err(e) => debug!("vector search failed, using keyword search: {e:#}"),
            }
        } else {
            debug!(unembedded, "knowledge base partially embedded, using keyword search");
        }

        self.store.keyword_search(query, limit).await
    }

    async fn vector_search(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
        let query_vec = self.provider.embed(query).await?;
        let vectors = self
            .store
            .ready_vectors(self.provider.embedding_model())
            .await?;

        let mut scored: Vec<ScoredChunk> = vectors
            .into_iter()
            .map(|v| ScoredChunk {
                score: cosine_similarity(&query_vec, &v.vector) as f64,
                chunk_id: v.chunk_id,
                content: v.content,
                source: v.source,
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }
}
