//! Persistence contract.
//!
//! The [`Store`] trait covers everything the chat, ingestion, and
//! retrieval layers need from durable storage: conversations and their
//! append-only messages, knowledge files, chunks, embeddings, and a
//! lexical index over chunk text.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`SqliteStore`] | Production. FTS5 for lexical search, cascading deletes. |
//! | [`InMemoryStore`] | Tests and embedding in other hosts. Term-count lexical scoring. |
//!
//! Implementations must be `Send + Sync`; every component holds an
//! `Arc<dyn Store>`.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::{
    Conversation, ConversationStatus, Embedding, FileStatus, KnowledgeChunk, KnowledgeFile,
    Message, ScoredChunk, StoredVector,
};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait Store: Send + Sync {
    // ── Conversations ──

    /// Fetch the conversation for `session_id`, creating it on first use.
    /// Two concurrent first messages for one session resolve to the same row.
    async fn get_or_create_conversation(
        &self,
        session_id: &str,
        page_url: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<Conversation>;

    async fn find_conversation(&self, session_id: &str) -> Result<Option<Conversation>>;

    async fn update_conversation(
        &self,
        id: &str,
        status: ConversationStatus,
        metadata: &Value,
    ) -> Result<()>;

    // ── Messages ──

    async fn append_message(&self, message: &Message) -> Result<()>;

    /// The last `limit` user/assistant turns, oldest first.
    async fn recent_history(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Every message of a conversation, oldest first.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    async fn count_user_messages(&self, conversation_id: &str) -> Result<i64>;

    /// User messages for a session created at or after `since_millis`.
    async fn count_recent_user_messages(&self, session_id: &str, since_millis: i64)
        -> Result<i64>;

    // ── Knowledge files ──

    async fn insert_file(&self, file: &KnowledgeFile) -> Result<()>;

    async fn get_file(&self, id: &str) -> Result<Option<KnowledgeFile>>;

    async fn list_files(&self, status: Option<FileStatus>) -> Result<Vec<KnowledgeFile>>;

    async fn set_file_status(&self, id: &str, status: FileStatus, chunk_count: i64) -> Result<()>;

    /// Remove a file record with all of its chunks and embeddings.
    async fn delete_file(&self, id: &str) -> Result<()>;

    // ── Chunks ──

    async fn insert_chunks(&self, chunks: &[KnowledgeChunk]) -> Result<()>;

    /// Remove all chunks of a file, with their embeddings and index rows.
    async fn delete_chunks(&self, file_id: &str) -> Result<()>;

    async fn list_chunks(&self, file_id: &str) -> Result<Vec<KnowledgeChunk>>;

    /// Chunks whose embedding is missing, from another model, or stale by hash.
    async fn chunks_needing_embedding(
        &self,
        model: &str,
        limit: Option<usize>,
    ) -> Result<Vec<KnowledgeChunk>>;

    // ── Embeddings ──

    /// Insert or replace the single embedding of a chunk.
    async fn upsert_embedding(&self, embedding: &Embedding) -> Result<()>;

    async fn clear_embeddings(&self) -> Result<u64>;

    /// All `model` vectors belonging to ready files.
    async fn ready_vectors(&self, model: &str) -> Result<Vec<StoredVector>>;

    /// Chunks of ready files that have no current `model` embedding.
    async fn count_unembedded_ready_chunks(&self, model: &str) -> Result<i64>;

    // ── Lexical search ──

    /// Full-text search over chunks of ready files, best match first.
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>>;
}

/// Lowercased alphanumeric terms of a free-text query.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    terms.dedup();
    terms
}

/// Build an FTS5 MATCH expression from user text: every term quoted and
/// OR-joined, so punctuation or FTS operators in the input never reach the
/// query parser. `None` when the text has no searchable terms.
pub fn fts_query(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(
            fts_query("What are your opening hours?").unwrap(),
            "\"what\" OR \"are\" OR \"your\" OR \"opening\" OR \"hours\""
        );
    }

    #[test]
    fn test_fts_query_strips_operators() {
        let q = fts_query("price* AND \"NEAR(\" -refund").unwrap();
        assert!(!q.contains('*'));
        assert!(!q.contains('('));
        assert!(q.contains("\"refund\""));
    }

    #[test]
    fn test_fts_query_empty() {
        assert!(fts_query("  ?!  ").is_none());
    }
}
