//! Chunk embedding: batching, retry, and vector utilities.
//!
//! Embedding requests go through [`ChatProvider::embed_batch`]. This
//! module owns the retry policy the provider layer deliberately leaves
//! out:
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - Network errors and timeouts → retry
//! - Other 4xx and missing credentials → fail immediately
//!
//! Backoff is exponential: 1s, 2s, 4s, ... capped at 32s.
//!
//! Batches run concurrently up to `embedding.concurrency`. A failed batch
//! is logged and counted; it never fails the caller, so ingestion still
//! completes and retrieval falls back to keyword search for the gap.
//!
//! Vectors are stored as little-endian `f32` BLOBs ([`vec_to_blob`] /
//! [`blob_to_vec`]).

use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;
use crate::models::{Embedding, KnowledgeChunk};
use crate::provider::{ChatProvider, ProviderError};
use crate::store::Store;

/// Outcome counts of an embedding run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedStats {
    pub embedded: u64,
    pub failed: u64,
}

impl EmbedStats {
    fn add(&mut self, other: EmbedStats) {
        self.embedded += other.embedded;
        self.failed += other.failed;
    }
}

fn is_retryable(e: &ProviderError) -> bool {
    match e {
        ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
        ProviderError::Network(_) | ProviderError::Timeout => true,
        ProviderError::Decode(_) | ProviderError::MissingCredential(_) => false,
    }
}

/// `embed_batch` with exponential backoff on transient failures.
pub async fn embed_with_retry(
    provider: &dyn ChatProvider,
    texts: &[String],
    max_retries: u32,
) -> Result<Vec<Option<Vec<f32>>>, ProviderError> {
    let mut attempt = 0;
    loop {
        match provider.embed_batch(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) if attempt < max_retries && is_retryable(&e) => {
                attempt += 1;
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                warn!(attempt, delay_secs = delay.as_secs(), "embedding request failed, retrying: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn embed_batch_into_store(
    provider: &dyn ChatProvider,
    store: &dyn Store,
    batch: &[KnowledgeChunk],
    max_retries: u32,
) -> EmbedStats {
    let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
    let vectors = match embed_with_retry(provider, &texts, max_retries).await {
        Ok(v) => v,
        Err(e) => {
            warn!(chunks = batch.len(), "embedding batch failed: {e}");
            return EmbedStats {
                embedded: 0,
                failed: batch.len() as u64,
            };
        }
    };

    let mut stats = EmbedStats::default();
    let model = provider.embedding_model().to_string();
    // zip would silently drop chunks if the vendor returned too few slots
    for (i, chunk) in batch.iter().enumerate() {
        let Some(Some(vector)) = vectors.get(i) else {
            debug!(chunk_id = %chunk.id, "no vector returned for chunk");
            stats.failed += 1;
            continue;
        };
        let embedding = Embedding {
            chunk_id: chunk.id.clone(),
            model: model.clone(),
            vector: vector.clone(),
            content_hash: chunk.hash().to_string(),
        };
        match store.upsert_embedding(&embedding).await {
            Ok(()) => stats.embedded += 1,
            Err(e) => {
                warn!(chunk_id = %chunk.id, "failed to store embedding: {e:#}");
                stats.failed += 1;
            }
        }
    }
    stats
}

/// Embed `chunks` in batches of `batch_size`, at most `concurrency`
/// batches in flight.
pub async fn embed_chunks(
    provider: &dyn ChatProvider,
    store: &dyn Store,
    chunks: &[KnowledgeChunk],
    config: &EmbeddingConfig,
) -> EmbedStats {
    if chunks.is_empty() {
        return EmbedStats::default();
    }
    let batch_size = config.batch_size.max(1);
    let batches: Vec<_> = chunks
        .chunks(batch_size)
        .map(|batch| embed_batch_into_store(provider, store, batch, config.max_retries))
        .collect();
    let results: Vec<EmbedStats> = futures::stream::iter(batches)
        .buffer_unordered(config.concurrency.max(1))
        .collect()
        .await;

    let mut total = EmbedStats::default();
    for r in results {
        total.add(r);
    }
    total
}

/// Embed every chunk whose embedding is missing, from another model, or
/// stale by content hash.
pub async fn embed_pending(
    provider: &dyn ChatProvider,
    store: &dyn Store,
    config: &EmbeddingConfig,
    limit: Option<usize>,
) -> Result<EmbedStats> {
    let pending = store
        .chunks_needing_embedding(provider.embedding_model(), limit)
        .await?;
    if pending.is_empty() {
        return Ok(EmbedStats::default());
    }
    info!(chunks = pending.len(), model = provider.embedding_model(), "embedding pending chunks");
    Ok(embed_chunks(provider, store, &pending, config).await)
}

/// Drop all embeddings and regenerate them.
pub async fn rebuild(
    provider: &dyn ChatProvider,
    store: &dyn Store,
    config: &EmbeddingConfig,
) -> Result<(u64, EmbedStats)> {
    let cleared = store.clear_embeddings().await?;
    info!(cleared, "cleared embeddings");
    let stats = embed_pending(provider, store, config, None).await?;
    Ok((cleared, stats))
}

// ============ Vector utilities ============

/// Encode as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Decode little-endian `f32` bytes. Trailing bytes that do not form a
/// whole value are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// `dot(a,b) / (|a|·|b|)`. Zero when either norm is zero, either vector is
/// empty, or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
