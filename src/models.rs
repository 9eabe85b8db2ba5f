//! Core data models shared by the store, ingestion, retrieval, and chat layers.
//!
//! Two ownership trees, both strict: a [`KnowledgeFile`] owns its
//! [`KnowledgeChunk`]s, each of which owns at most one [`Embedding`]; a
//! [`Conversation`] owns its [`Message`]s. Messages are append-only and
//! ordered by creation time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(anyhow::anyhow!(
                        "invalid {}: '{}'",
                        stringify!($name),
                        other
                    )),
                }
            }
        }
    };
}

/// Author of a message turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

string_enum!(Role {
    System => "system",
    User => "user",
    Assistant => "assistant",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Escalated,
    Closed,
}

string_enum!(ConversationStatus {
    Active => "active",
    Escalated => "escalated",
    Closed => "closed",
});

/// Processing state of a knowledge file. `Ready` and `Error` are terminal
/// for one ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Processing,
    Ready,
    Error,
}

string_enum!(FileStatus {
    Processing => "processing",
    Ready => "ready",
    Error => "error",
});

/// One chat session.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub session_id: String,
    pub page_url: Option<String>,
    pub ip_address: Option<String>,
    pub status: ConversationStatus,
    pub metadata: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn new(session_id: &str, page_url: Option<&str>, ip_address: Option<&str>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            page_url: page_url.map(str::to_string),
            ip_address: ip_address.map(str::to_string),
            status: ConversationStatus::Active,
            metadata: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One turn in a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: Option<String>,
    pub tool_calls: Option<Value>,
    pub tool_results: Option<Value>,
    pub tokens_used: Option<i64>,
    pub created_at: i64,
}

impl Message {
    pub fn new(conversation_id: &str, role: Role, content: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content,
            tool_calls: None,
            tool_results: None,
            tokens_used: None,
            created_at: now_millis(),
        }
    }

    pub fn with_tool_calls(mut self, calls: Option<Value>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn with_tool_results(mut self, results: Option<Value>) -> Self {
        self.tool_results = results;
        self
    }

    pub fn with_tokens(mut self, tokens: Option<i64>) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// An uploaded source document.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeFile {
    pub id: String,
    /// Opaque blob-store key.
    pub filename: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    pub status: FileStatus,
    pub chunk_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl KnowledgeFile {
    /// A fresh record in `processing` state.
    pub fn new(filename: &str, original_name: &str, mime_type: &str, size: i64) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            original_name: original_name.to_string(),
            mime_type: mime_type.to_string(),
            size,
            status: FileStatus::Processing,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A contiguous slice of a file's extracted text.
#[derive(Debug, Clone)]
pub struct KnowledgeChunk {
    pub id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
    pub metadata: Value,
}

impl KnowledgeChunk {
    pub fn new(file_id: &str, chunk_index: i64, content: String, metadata: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_id: file_id.to_string(),
            chunk_index,
            token_count: crate::chunk::estimate_tokens(&content) as i64,
            content,
            metadata,
        }
    }

    /// Content hash recorded at chunking time, used for embedding staleness.
    pub fn hash(&self) -> &str {
        self.metadata
            .get("hash")
            .and_then(|h| h.as_str())
            .unwrap_or_default()
    }
}

/// Vector for exactly one chunk, tagged with the model that produced it.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub chunk_id: String,
    pub model: String,
    pub vector: Vec<f32>,
    pub content_hash: String,
}

/// Embedding joined with the chunk text and source file name, loaded for
/// vector scoring.
#[derive(Debug, Clone)]
pub struct StoredVector {
    pub chunk_id: String,
    pub content: String,
    pub source: String,
    pub vector: Vec<f32>,
}

/// A chunk with a relevance score, from either search strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub content: String,
    pub source: String,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_text() {
        for s in ["processing", "ready", "error"] {
            assert_eq!(s.parse::<FileStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<FileStatus>().is_err());
        assert_eq!("escalated".parse::<ConversationStatus>().unwrap(), ConversationStatus::Escalated);
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }

    #[test]
    fn test_new_conversation_is_active_with_empty_metadata() {
        let c = Conversation::new("sess-1", Some("https://example.com"), None);
        assert_eq!(c.status, ConversationStatus::Active);
        assert!(c.metadata.as_object().unwrap().is_empty());
        assert_eq!(c.page_url.as_deref(), Some("https://example.com"));
    }
}
