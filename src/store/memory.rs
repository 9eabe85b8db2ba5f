//! In-memory [`Store`] implementation.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Lexical search
//! scores a chunk by how many distinct query terms it contains.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{query_terms, Store};
use crate::models::{
    now_millis, Conversation, ConversationStatus, Embedding, FileStatus, KnowledgeChunk,
    KnowledgeFile, Message, Role, ScoredChunk, StoredVector,
};

#[derive(Default)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<String, Conversation>>,
    messages: RwLock<Vec<Message>>,
    files: RwLock<Vec<KnowledgeFile>>,
    chunks: RwLock<Vec<KnowledgeChunk>>,
    embeddings: RwLock<HashMap<String, Embedding>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

impl InMemoryStore {
    fn ready_file_names(&self) -> Result<HashMap<String, String>> {
        Ok(self
            .files
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|f| f.status == FileStatus::Ready)
            .map(|f| (f.id.clone(), f.original_name.clone()))
            .collect())
    }

    fn remove_chunks_of(&self, file_id: &str) -> Result<()> {
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        let mut embeddings = self.embeddings.write().map_err(poisoned)?;
        chunks.retain(|c| {
            if c.file_id == file_id {
                embeddings.remove(&c.id);
                false
            } else {
                true
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_or_create_conversation(
        &self,
        session_id: &str,
        page_url: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<Conversation> {
        let mut conversations = self.conversations.write().map_err(poisoned)?;
        let conversation = conversations
            .entry(session_id.to_string())
            .or_insert_with(|| Conversation::new(session_id, page_url, ip_address));
        Ok(conversation.clone())
    }

    async fn find_conversation(&self, session_id: &str) -> Result<Option<Conversation>> {
        Ok(self
            .conversations
            .read()
            .map_err(poisoned)?
            .get(session_id)
            .cloned())
    }

    async fn update_conversation(
        &self,
        id: &str,
        status: ConversationStatus,
        metadata: &Value,
    ) -> Result<()> {
        let mut conversations = self.conversations.write().map_err(poisoned)?;
        if let Some(c) = conversations.values_mut().find(|c| c.id == id) {
            c.status = status;
            c.metadata = metadata.clone();
            c.updated_at = now_millis();
        }
        Ok(())
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        self.messages.write().map_err(poisoned)?.push(message.clone());
        Ok(())
    }

    async fn recent_history(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let messages = self.messages.read().map_err(poisoned)?;
        let turns: Vec<Message> = messages
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id && matches!(m.role, Role::User | Role::Assistant)
            })
            .cloned()
            .collect();
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.into_iter().skip(skip).collect())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .messages
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn count_user_messages(&self, conversation_id: &str) -> Result<i64> {
        Ok(self
            .messages
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.role == Role::User)
            .count() as i64)
    }

    async fn count_recent_user_messages(
        &self,
        session_id: &str,
        since_millis: i64,
    ) -> Result<i64> {
        let conversation_id = match self.find_conversation(session_id).await? {
            Some(c) => c.id,
            None => return Ok(0),
        };
        Ok(self
            .messages
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.role == Role::User
                    && m.created_at >= since_millis
            })
            .count() as i64)
    }

    async fn insert_file(&self, file: &KnowledgeFile) -> Result<()> {
        self.files.write().map_err(poisoned)?.push(file.clone());
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<Option<KnowledgeFile>> {
        Ok(self
            .files
            .read()
            .map_err(poisoned)?
            .iter()
            .find(|f| f.id == id)
            .cloned())
    }

    async fn list_files(&self, status: Option<FileStatus>) -> Result<Vec<KnowledgeFile>> {
        Ok(self
            .files
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|f| status.map_or(true, |s| f.status == s))
            .cloned()
            .collect())
    }

    async fn set_file_status(&self, id: &str, status: FileStatus, chunk_count: i64) -> Result<()> {
        let mut files = self.files.write().map_err(poisoned)?;
        if let Some(f) = files.iter_mut().find(|f| f.id == id) {
            f.status = status;
            f.chunk_count = chunk_count;
            f.updated_at = now_millis();
        }
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> Result<()> {
        self.remove_chunks_of(id)?;
        self.files.write().map_err(poisoned)?.retain(|f| f.id != id);
        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[KnowledgeChunk]) -> Result<()> {
        self.chunks
            .write()
            .map_err(poisoned)?
            .extend(chunks.iter().cloned());
        Ok(())
    }

    async fn delete_chunks(&self, file_id: &str) -> Result<()> {
        self.remove_chunks_of(file_id)
    }

    async fn list_chunks(&self, file_id: &str) -> Result<Vec<KnowledgeChunk>> {
        let mut chunks: Vec<KnowledgeChunk> = self
            .chunks
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|c| c.file_id == file_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn chunks_needing_embedding(
        &self,
        model: &str,
        limit: Option<usize>,
    ) -> Result<Vec<KnowledgeChunk>> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        let embeddings = self.embeddings.read().map_err(poisoned)?;
        Ok(chunks
            .iter()
            .filter(|c| match embeddings.get(&c.id) {
                None => true,
                Some(e) => e.model != model || e.content_hash != c.hash(),
            })
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn upsert_embedding(&self, embedding: &Embedding) -> Result<()> {
        self.embeddings
            .write()
            .map_err(poisoned)?
            .insert(embedding.chunk_id.clone(), embedding.clone());
        Ok(())
    }

    async fn clear_embeddings(&self) -> Result<u64> {
        let mut embeddings = self.embeddings.write().map_err(poisoned)?;
        let n = embeddings.len() as u64;
        embeddings.clear();
        Ok(n)
    }

    async fn ready_vectors(&self, model: &str) -> Result<Vec<StoredVector>> {
        let ready = self.ready_file_names()?;
        let chunks = self.chunks.read().map_err(poisoned)?;
        let embeddings = self.embeddings.read().map_err(poisoned)?;
        Ok(chunks
            .iter()
            .filter_map(|c| {
                let source = ready.get(&c.file_id)?;
                let e = embeddings.get(&c.id).filter(|e| e.model == model)?;
                Some(StoredVector {
                    chunk_id: c.id.clone(),
                    content: c.content.clone(),
                    source: source.clone(),
                    vector: e.vector.clone(),
                })
            })
            .collect())
    }

    async fn count_unembedded_ready_chunks(&self, model: &str) -> Result<i64> {
        let ready = self.ready_file_names()?;
        let chunks = self.chunks.read().map_err(poisoned)?;
        let embeddings = self.embeddings.read().map_err(poisoned)?;
        Ok(chunks
            .iter()
            .filter(|c| ready.contains_key(&c.file_id))
            .filter(|c| !embeddings.get(&c.id).is_some_and(|e| e.model == model))
            .count() as i64)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let ready = self.ready_file_names()?;
        let chunks = self.chunks.read().map_err(poisoned)?;

        let mut results: Vec<ScoredChunk> = chunks
            .iter()
            .filter_map(|c| {
                let source = ready.get(&c.file_id)?;
                let lower = c.content.to_lowercase();
                let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
                (hits > 0).then(|| ScoredChunk {
                    chunk_id: c.id.clone(),
                    content: c.content.clone(),
                    source: source.clone(),
                    score: hits as f64,
                })
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }
}
