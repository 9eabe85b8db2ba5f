//! Deterministic stand-ins for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{parse_config, Config};
use crate::models::{
    Conversation, ConversationStatus, Embedding, FileStatus, KnowledgeChunk, KnowledgeFile,
    Message, ScoredChunk, StoredVector,
};
use crate::provider::{
    ChatMessage, ChatOptions, ChatProvider, ChatResult, EventStream, ProviderError, StreamEvent,
    ToolSchema, Usage, STREAM_BUFFER,
};
use crate::store::{query_terms, InMemoryStore, Store};
use crate::tools::PageFetcher;

pub(crate) const TEST_CONFIG: &str = r#"
[db]
path = "/tmp/sitechat-test.sqlite"

[storage]
blob_dir = "/tmp/sitechat-test-blobs"

[agent]
enabled = true
api_key = "sk-test"

[server]
bind = "127.0.0.1:0"
"#;

pub(crate) fn test_config() -> Config {
    parse_config(TEST_CONFIG).expect("test config parses")
}

const DIMS: usize = 32;

/// Hashed bag-of-words vector, so texts sharing terms score higher.
pub(crate) fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    for term in query_terms(text) {
        let h = term
            .bytes()
            .fold(2166136261u32, |h, b| (h ^ b as u32).wrapping_mul(16777619));
        v[h as usize % DIMS] += 1.0;
    }
    v
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<String>,
    pub options: ChatOptions,
}

/// Scripted chat replies plus bag-of-words embeddings.
#[derive(Default)]
pub(crate) struct StubProvider {
    replies: Mutex<VecDeque<Result<ChatResult, u16>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    embed_calls: AtomicUsize,
    embed_failures: AtomicU32,
    embed_failure_status: AtomicU32,
}

impl StubProvider {
    pub fn with_replies(replies: Vec<ChatResult>) -> Self {
        let s = Self::default();
        s.replies
            .lock()
            .unwrap()
            .extend(replies.into_iter().map(Ok));
        s
    }

    /// Queue a vendor error with `status` as the next chat reply.
    pub fn then_error(self, status: u16) -> Self {
        self.replies.lock().unwrap().push_back(Err(status));
        self
    }

    /// Fail the next `times` embedding calls with `status`.
    pub fn failing_embeddings(self, times: u32, status: u16) -> Self {
        self.embed_failures.store(times, Ordering::SeqCst);
        self.embed_failure_status.store(status as u32, Ordering::SeqCst);
        self
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_reply(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &ChatOptions,
    ) -> Result<ChatResult, ProviderError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages: messages.to_vec(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
            options: *options,
        });
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(r)) => Ok(r),
            Some(Err(status)) => Err(ProviderError::Api {
                vendor: "stub",
                status,
                message: "scripted failure".to_string(),
            }),
            None => Ok(ChatResult::default()),
        }
    }
}

#[async_trait]
impl ChatProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    fn embedding_model(&self) -> &str {
        "stub-embed"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &ChatOptions,
    ) -> Result<ChatResult, ProviderError> {
        self.next_reply(messages, tools, options)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &ChatOptions,
    ) -> Result<EventStream, ProviderError> {
        let reply = self.next_reply(messages, tools, options)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let chars: Vec<char> = reply.text.chars().collect();
            for piece in chars.chunks(3) {
                let delta: String = piece.iter().collect();
                if tx.send(Ok(StreamEvent::TextDelta(delta))).await.is_err() {
                    return;
                }
            }
            if !reply.tool_calls.is_empty()
                && tx
                    .send(Ok(StreamEvent::ToolCalls(reply.tool_calls)))
                    .await
                    .is_err()
            {
                return;
            }
            if reply.usage != Usage::default()
                && tx.send(Ok(StreamEvent::Usage(reply.usage))).await.is_err()
            {
                return;
            }
            let _ = tx.send(Ok(StreamEvent::Done)).await;
        });
        Ok(rx)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, ProviderError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.embed_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.embed_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Api {
                vendor: "stub",
                status: self.embed_failure_status.load(Ordering::SeqCst) as u16,
                message: "scripted failure".to_string(),
            });
        }
        Ok(texts.iter().map(|t| Some(bag_of_words(t))).collect())
    }
}

/// Page fetcher serving fixed HTML by URL.
#[derive(Default)]
pub(crate) struct StaticPages {
    pages: HashMap<String, String>,
}

impl StaticPages {
    pub fn with_page(mut self, url: &str, html: &str) -> Self {
        self.pages.insert(url.to_string(), html.to_string());
        self
    }
}

#[async_trait]
impl PageFetcher for StaticPages {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("404 for {}", url))
    }
}

/// In-memory store whose file writes can be made to fail on demand.
#[derive(Default)]
pub(crate) struct FlakyStore {
    pub inner: Arc<InMemoryStore>,
    fail_insert_file: AtomicBool,
    fail_ready_status: AtomicBool,
}

impl FlakyStore {
    pub fn failing_insert_file(self) -> Self {
        self.fail_insert_file.store(true, Ordering::SeqCst);
        self
    }

    /// Fail only the transition to `ready`; other status writes succeed.
    pub fn failing_ready_status(self) -> Self {
        self.fail_ready_status.store(true, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get_or_create_conversation(
        &self,
        session_id: &str,
        page_url: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<Conversation> {
        self.inner
            .get_or_create_conversation(session_id, page_url, ip_address)
            .await
    }

    async fn find_conversation(&self, session_id: &str) -> Result<Option<Conversation>> {
        self.inner.find_conversation(session_id).await
    }

    async fn update_conversation(
        &self,
        id: &str,
        status: ConversationStatus,
        metadata: &Value,
    ) -> Result<()> {
        self.inner.update_conversation(id, status, metadata).await
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        self.inner.append_message(message).await
    }

    async fn recent_history(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.inner.recent_history(conversation_id, limit).await
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.inner.list_messages(conversation_id).await
    }

    async fn count_user_messages(&self, conversation_id: &str) -> Result<i64> {
        self.inner.count_user_messages(conversation_id).await
    }

    async fn count_recent_user_messages(
        &self,
        session_id: &str,
        since_millis: i64,
    ) -> Result<i64> {
        self.inner
            .count_recent_user_messages(session_id, since_millis)
            .await
    }

    async fn insert_file(&self, file: &KnowledgeFile) -> Result<()> {
        if self.fail_insert_file.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.inner.insert_file(file).await
    }

    async fn get_file(&self, id: &str) -> Result<Option<KnowledgeFile>> {
        self.inner.get_file(id).await
    }

    async fn list_files(&self, status: Option<FileStatus>) -> Result<Vec<KnowledgeFile>> {
        self.inner.list_files(status).await
    }

    async fn set_file_status(&self, id: &str, status: FileStatus, chunk_count: i64) -> Result<()> {
        if status == FileStatus::Ready && self.fail_ready_status.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        self.inner.set_file_status(id, status, chunk_count).await
    }

    async fn delete_file(&self, id: &str) -> Result<()> {
        self.inner.delete_file(id).await
    }

    async fn insert_chunks(&self, chunks: &[KnowledgeChunk]) -> Result<()> {
        self.inner.insert_chunks(chunks).await
    }

    async fn delete_chunks(&self, file_id: &str) -> Result<()> {
        self.inner.delete_chunks(file_id).await
    }

    async fn list_chunks(&self, file_id: &str) -> Result<Vec<KnowledgeChunk>> {
        self.inner.list_chunks(file_id).await
    }

    async fn chunks_needing_embedding(
        &self,
        model: &str,
        limit: Option<usize>,
    ) -> Result<Vec<KnowledgeChunk>> {
        self.inner.chunks_needing_embedding(model, limit).await
    }

    async fn upsert_embedding(&self, embedding: &Embedding) -> Result<()> {
        self.inner.upsert_embedding(embedding).await
    }

    async fn clear_embeddings(&self) -> Result<u64> {
        self.inner.clear_embeddings().await
    }

    async fn ready_vectors(&self, model: &str) -> Result<Vec<StoredVector>> {
        self.inner.ready_vectors(model).await
    }

    async fn count_unembedded_ready_chunks(&self, model: &str) -> Result<i64> {
        self.inner.count_unembedded_ready_chunks(model).await
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
        self.inner.keyword_search(query, limit).await
    }
}
