//! Error types at the chat and ingestion boundaries.
//!
//! Internal plumbing uses `anyhow`; these enums exist where a caller has
//! to branch on the kind of failure (HTTP status mapping, CLI messages).

use crate::extract::ExtractError;

/// Failures of a chat turn that short-circuit before or instead of a reply.
///
/// Only `NotConfigured`, `Validation`, and `RateLimited` happen before any
/// state is written. Provider failures never surface here; they become the
/// configured error message on a persisted reply.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("the chat agent is not configured")]
    NotConfigured,

    #[error("{0}")]
    Validation(String),

    #[error("too many messages, please wait a moment before trying again")]
    RateLimited,

    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("file is {size} bytes, larger than the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error("knowledge file not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Extraction(#[from] ExtractError),

    #[error("no text could be extracted from {0}")]
    Empty(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
