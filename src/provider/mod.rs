//! Vendor-neutral chat, streaming, and embedding client.
//!
//! Every vendor implements [`ChatProvider`]; the rest of the crate only
//! ever sees the types in this module.
//!
//! | Operation | Result |
//! |-----------|--------|
//! | [`chat`](ChatProvider::chat) | [`ChatResult`]: text, decoded tool calls, usage, finish reason |
//! | [`stream`](ChatProvider::stream) | [`EventStream`] of `TextDelta* → ToolCalls? → Done` |
//! | [`embed`](ChatProvider::embed) | one vector |
//! | [`embed_batch`](ChatProvider::embed_batch) | one `Option<vector>` per input, position-preserving |
//!
//! # Vendor differences handled here
//!
//! - **System messages.** OpenAI takes them as turns; Anthropic folds all of
//!   them into one top-level `system` field.
//! - **Tool schemas.** `{type: function, function: {...}}` vs `{name, input_schema}`.
//!   An empty tool list omits the field (and `tool_choice`) entirely.
//! - **Streaming tool calls.** Both vendors send argument JSON in fragments.
//!   Fragments are buffered per call and surfaced as one `ToolCalls` event
//!   once complete; an undecodable payload becomes an empty argument map.
//! - **Embeddings.** Anthropic has no embeddings API, so both providers use
//!   the OpenAI embeddings endpoint.
//!
//! No retries happen inside this module; callers own retry policy.

pub mod anthropic;
pub mod openai;
pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{Config, ProviderKind};
use crate::models::Role;

pub use anthropic::AnthropicProvider;
pub use openai::{OpenAiEmbeddings, OpenAiProvider};

/// Capacity of every event channel: one event in flight, so a slow
/// consumer pauses generation instead of queueing it.
pub const STREAM_BUFFER: usize = 1;

// ═══════════════════════════════════════════════════════════════════════
// Wire-neutral types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A tool as advertised to the model.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A decoded tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: match arguments {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(|v| v.as_str())
    }
}

/// Per-request overrides. `None` falls back to the provider's defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatOptions {
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            max_tokens: None,
        }
    }
}

/// Defaults applied when a request leaves an option unset.
#[derive(Debug, Clone, Copy)]
pub struct GenerationDefaults {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationDefaults {
    pub fn resolve(&self, options: &ChatOptions) -> (f32, u32) {
        (
            options.temperature.unwrap_or(self.temperature),
            options.max_tokens.unwrap_or(self.max_tokens),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Add another call's usage into this one.
    pub fn merge(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResult {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCalls(Vec<ToolCall>),
    /// Token counts for the whole call; sent at most once, before `Done`.
    Usage(Usage),
    Done,
}

/// Single-consumer event sequence. Dropping the receiver tears down the
/// underlying HTTP response.
pub type EventStream = mpsc::Receiver<Result<StreamEvent, ProviderError>>;

// ═══════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{vendor} API error {status}: {message}")]
    Api {
        vendor: &'static str,
        status: u16,
        message: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("missing API credential for {0}")]
    MissingCredential(&'static str),
}

impl ProviderError {
    /// HTTP-equivalent status code.
    pub fn status(&self) -> u16 {
        match self {
            ProviderError::Api { status, .. } => *status,
            ProviderError::Network(_) => 503,
            ProviderError::Timeout => 504,
            ProviderError::Decode(_) => 502,
            ProviderError::MissingCredential(_) => 401,
        }
    }

    pub(crate) fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Trim a vendor error body down to its message, for logs and errors.
pub(crate) fn truncate_error(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = json
            .pointer("/error/message")
            .or_else(|| json.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
    }
    if body.chars().count() > 200 {
        format!("{}...", body.chars().take(200).collect::<String>())
    } else {
        body.to_string()
    }
}

/// Read a non-2xx response into a [`ProviderError::Api`].
pub(crate) async fn status_error(vendor: &'static str, resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    warn!(vendor, status, "provider request failed");
    ProviderError::Api {
        vendor,
        status,
        message: truncate_error(&body),
    }
}

/// Decode a tool-call argument payload. Anything that is not a JSON object
/// degrades to an empty map.
pub fn decode_arguments(raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            warn!("undecodable tool arguments, using empty map");
            Map::new()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Provider trait
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Vendor identifier, e.g. `"openai"`.
    fn name(&self) -> &str;

    /// Model name recorded on stored embeddings.
    fn embedding_model(&self) -> &str;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &ChatOptions,
    ) -> Result<ChatResult, ProviderError>;

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &ChatOptions,
    ) -> Result<EventStream, ProviderError>;

    /// One slot per input. A slot is `None` when the vendor response had no
    /// entry for that position.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, ProviderError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| ProviderError::Decode("empty embedding response".to_string()))
    }
}

/// Build the provider selected by `[agent].provider`.
pub fn create_provider(config: &Config) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    let agent = &config.agent;
    let api_key = agent
        .resolve_api_key()
        .ok_or(ProviderError::MissingCredential(agent.provider.as_str()))?;
    let defaults = GenerationDefaults {
        temperature: agent.temperature,
        max_tokens: agent.max_tokens,
    };
    let timeout = Duration::from_secs(agent.request_timeout_secs);
    let embeddings = OpenAiEmbeddings::new(
        config.embedding.resolve_api_key(agent),
        config.embedding.model.clone(),
        timeout,
    );

    Ok(match agent.provider {
        ProviderKind::Openai => Arc::new(OpenAiProvider::new(
            api_key,
            agent.openai_model.clone(),
            defaults,
            timeout,
            embeddings,
        )),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
            api_key,
            agent.anthropic_model.clone(),
            defaults,
            timeout,
            embeddings,
        )),
    })
}

/// Stand-in used when no chat credential is configured. Every request
/// fails with [`ProviderError::MissingCredential`]; the embedding model
/// name is still reported so keyword fallback and staleness checks work.
pub struct DisabledProvider {
    embedding_model: String,
}

impl DisabledProvider {
    pub fn new(embedding_model: impl Into<String>) -> Self {
        Self {
            embedding_model: embedding_model.into(),
        }
    }
}

#[async_trait]
impl ChatProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolSchema],
        _options: &ChatOptions,
    ) -> Result<ChatResult, ProviderError> {
        Err(ProviderError::MissingCredential("chat"))
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolSchema],
        _options: &ChatOptions,
    ) -> Result<EventStream, ProviderError> {
        Err(ProviderError::MissingCredential("chat"))
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, ProviderError> {
        Err(ProviderError::MissingCredential("embeddings"))
    }
}

/// [`create_provider`], or a [`DisabledProvider`] when it cannot be built.
pub fn create_provider_or_disabled(config: &Config) -> Arc<dyn ChatProvider> {
    match create_provider(config) {
        Ok(p) => p,
        Err(e) => {
            warn!("chat provider unavailable: {e}");
            Arc::new(DisabledProvider::new(config.embedding.model.clone()))
        }
    }
}

/// Shared HTTP client. Only the connect phase is bounded here; request
/// timeouts are set per call so long streams are not cut off.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
