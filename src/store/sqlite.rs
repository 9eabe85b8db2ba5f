//! SQLite-backed [`Store`] implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{fts_query, Store};
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{
    now_millis, Conversation, ConversationStatus, Embedding, FileStatus, KnowledgeChunk,
    KnowledgeFile, Message, ScoredChunk, StoredVector,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_json(text: Option<String>) -> Option<Value> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let status: String = row.get("status");
    let metadata: String = row.get("metadata_json");
    Ok(Conversation {
        id: row.get("id"),
        session_id: row.get("session_id"),
        page_url: row.get("page_url"),
        ip_address: row.get("ip_address"),
        status: status.parse()?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| Value::Object(Default::default())),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let role: String = row.get("role");
    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: role.parse()?,
        content: row.get("content"),
        tool_calls: parse_json(row.get("tool_calls_json")),
        tool_results: parse_json(row.get("tool_results_json")),
        tokens_used: row.get("tokens_used"),
        created_at: row.get("created_at"),
    })
}

fn file_from_row(row: &SqliteRow) -> Result<KnowledgeFile> {
    let status: String = row.get("status");
    Ok(KnowledgeFile {
        id: row.get("id"),
        filename: row.get("filename"),
        original_name: row.get("original_name"),
        mime_type: row.get("mime_type"),
        size: row.get("size"),
        status: status.parse()?,
        chunk_count: row.get("chunk_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn chunk_from_row(row: &SqliteRow) -> KnowledgeChunk {
    let metadata: String = row.get("metadata_json");
    KnowledgeChunk {
        id: row.get("id"),
        file_id: row.get("file_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        token_count: row.get("token_count"),
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
    }
}

const CONVERSATION_COLUMNS: &str =
    "id, session_id, page_url, ip_address, status, metadata_json, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, tool_calls_json, \
     tool_results_json, tokens_used, created_at";
const FILE_COLUMNS: &str =
    "id, filename, original_name, mime_type, size, status, chunk_count, created_at, updated_at";

#[async_trait]
impl Store for SqliteStore {
    async fn get_or_create_conversation(
        &self,
        session_id: &str,
        page_url: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<Conversation> {
        let fresh = Conversation::new(session_id, page_url, ip_address);
        sqlx::query(
            r#"
            INSERT INTO conversations (id, session_id, page_url, ip_address, status,
                                       metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, '{}', ?, ?)
            ON CONFLICT(session_id) DO NOTHING
            "#,
        )
        .bind(&fresh.id)
        .bind(&fresh.session_id)
        .bind(&fresh.page_url)
        .bind(&fresh.ip_address)
        .bind(fresh.status.as_str())
        .bind(fresh.created_at)
        .bind(fresh.updated_at)
        .execute(&self.pool)
        .await?;

        self.find_conversation(session_id)
            .await?
            .with_context(|| format!("conversation for session {} vanished after insert", session_id))
    }

    async fn find_conversation(&self, session_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM conversations WHERE session_id = ?",
            CONVERSATION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn update_conversation(
        &self,
        id: &str,
        status: ConversationStatus,
        metadata: &Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET status = ?, metadata_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(metadata.to_string())
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, tool_calls_json,
                                  tool_results_json, tokens_used, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.tool_calls.as_ref().map(|v| v.to_string()))
        .bind(message.tool_results.as_ref().map(|v| v.to_string()))
        .bind(message.tokens_used)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_history(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM messages
            WHERE conversation_id = ? AND role IN ('user', 'assistant')
            ORDER BY created_at DESC, seq DESC
            LIMIT ?
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows.iter().map(message_from_row).collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY created_at, seq",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn count_user_messages(&self, conversation_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ? AND role = 'user'",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_recent_user_messages(
        &self,
        session_id: &str,
        since_millis: i64,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE c.session_id = ? AND m.role = 'user' AND m.created_at >= ?
            "#,
        )
        .bind(session_id)
        .bind(since_millis)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn insert_file(&self, file: &KnowledgeFile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO knowledge_files (id, filename, original_name, mime_type, size,
                                         status, chunk_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.id)
        .bind(&file.filename)
        .bind(&file.original_name)
        .bind(&file.mime_type)
        .bind(file.size)
        .bind(file.status.as_str())
        .bind(file.chunk_count)
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<Option<KnowledgeFile>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM knowledge_files WHERE id = ?",
            FILE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(file_from_row).transpose()
    }

    async fn list_files(&self, status: Option<FileStatus>) -> Result<Vec<KnowledgeFile>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM knowledge_files WHERE status = ? ORDER BY created_at",
                    FILE_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM knowledge_files ORDER BY created_at",
                    FILE_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(file_from_row).collect()
    }

    async fn set_file_status(&self, id: &str, status: FileStatus, chunk_count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE knowledge_files SET status = ?, chunk_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(chunk_count)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM knowledge_chunks WHERE file_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE file_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM knowledge_chunks WHERE file_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM knowledge_files WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[KnowledgeChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO knowledge_chunks (id, file_id, chunk_index, content, token_count, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.file_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.token_count)
            .bind(chunk.metadata.to_string())
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, file_id, content) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.file_id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_chunks(&self, file_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM knowledge_chunks WHERE file_id = ?)",
        )
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM knowledge_chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_chunks(&self, file_id: &str) -> Result<Vec<KnowledgeChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, file_id, chunk_index, content, token_count, metadata_json
            FROM knowledge_chunks WHERE file_id = ? ORDER BY chunk_index
            "#,
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn chunks_needing_embedding(
        &self,
        model: &str,
        limit: Option<usize>,
    ) -> Result<Vec<KnowledgeChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.file_id, c.chunk_index, c.content, c.token_count, c.metadata_json
            FROM knowledge_chunks c
            LEFT JOIN embeddings e ON e.chunk_id = c.id
            WHERE e.chunk_id IS NULL
               OR e.model != ?
               OR e.content_hash != COALESCE(json_extract(c.metadata_json, '$.hash'), '')
            ORDER BY c.file_id, c.chunk_index
            LIMIT ?
            "#,
        )
        .bind(model)
        .bind(limit.map(|l| l as i64).unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn upsert_embedding(&self, embedding: &Embedding) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (chunk_id, model, dims, content_hash, vector, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                content_hash = excluded.content_hash,
                vector = excluded.vector,
                created_at = excluded.created_at
            "#,
        )
        .bind(&embedding.chunk_id)
        .bind(&embedding.model)
        .bind(embedding.vector.len() as i64)
        .bind(&embedding.content_hash)
        .bind(vec_to_blob(&embedding.vector))
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_embeddings(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM embeddings")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ready_vectors(&self, model: &str) -> Result<Vec<StoredVector>> {
        let rows = sqlx::query(
            r#"
            SELECT e.chunk_id, c.content, f.original_name, e.vector
            FROM embeddings e
            JOIN knowledge_chunks c ON c.id = e.chunk_id
            JOIN knowledge_files f ON f.id = c.file_id
            WHERE f.status = 'ready' AND e.model = ?
            "#,
        )
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                StoredVector {
                    chunk_id: row.get("chunk_id"),
                    content: row.get("content"),
                    source: row.get("original_name"),
                    vector: blob_to_vec(&blob),
                }
            })
            .collect())
    }

    async fn count_unembedded_ready_chunks(&self, model: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM knowledge_chunks c
            JOIN knowledge_files f ON f.id = c.file_id
            LEFT JOIN embeddings e ON e.chunk_id = c.id AND e.model = ?
            WHERE f.status = 'ready' AND e.chunk_id IS NULL
            "#,
        )
        .bind(model)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT chunks_fts.chunk_id, c.content, f.original_name, chunks_fts.rank AS rank
            FROM chunks_fts
            JOIN knowledge_chunks c ON c.id = chunks_fts.chunk_id
            JOIN knowledge_files f ON f.id = c.file_id
            WHERE chunks_fts MATCH ? AND f.status = 'ready'
            ORDER BY chunks_fts.rank
            LIMIT ?
            "#,
        )
        .bind(match_expr)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ScoredChunk {
                    chunk_id: row.get("chunk_id"),
                    content: row.get("content"),
                    source: row.get("original_name"),
                    score: -rank,
                }
            })
            .collect())
    }
}
