//! Anthropic Messages API.
//!
//! System turns are folded into the top-level `system` field and the
//! remaining turns are normalized to strictly alternate, starting with a
//! user turn. Embeddings are delegated to [`OpenAiEmbeddings`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::sse::{self, SseFrame, StreamParser};
use super::{
    decode_arguments, http_client, status_error, ChatMessage, ChatOptions, ChatProvider,
    ChatResult, EventStream, GenerationDefaults, OpenAiEmbeddings, ProviderError, StreamEvent,
    ToolCall, ToolSchema, Usage, STREAM_BUFFER,
};
use crate::models::Role;

const VENDOR: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize, PartialEq)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Split out system text and coerce the rest into alternating turns.
fn normalize_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<WireMessage>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System && !m.content.trim().is_empty())
        .map(|m| m.content.as_str())
        .collect();

    let mut turns: Vec<WireMessage> = Vec::new();
    for m in messages.iter().filter(|m| m.role != Role::System) {
        if m.content.trim().is_empty() {
            continue;
        }
        let role = if m.role == Role::User { "user" } else { "assistant" };
        if turns.is_empty() && role == "assistant" {
            continue;
        }
        match turns.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&m.content);
            }
            _ => turns.push(WireMessage {
                role,
                content: m.content.clone(),
            }),
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, turns)
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    defaults: GenerationDefaults,
    timeout: Duration,
    embeddings: OpenAiEmbeddings,
}

impl AnthropicProvider {
    pub fn new(
        api_key: String,
        model: String,
        defaults: GenerationDefaults,
        timeout: Duration,
        embeddings: OpenAiEmbeddings,
    ) -> Self {
        Self {
            client: http_client(),
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.to_string(),
            defaults,
            timeout,
            embeddings,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_request<'a>(
        &'a self,
        messages: &[ChatMessage],
        tools: &'a [ToolSchema],
        options: &ChatOptions,
        stream: bool,
    ) -> MessagesRequest<'a> {
        let (temperature, max_tokens) = self.defaults.resolve(options);
        let (system, messages) = normalize_messages(messages);
        MessagesRequest {
            model: &self.model,
            max_tokens,
            temperature,
            system,
            messages,
            tools: tools
                .iter()
                .map(|t| WireTool {
                    name: &t.name,
                    description: &t.description,
                    input_schema: &t.parameters,
                })
                .collect(),
            stream,
        }
    }

    async fn post(
        &self,
        body: &MessagesRequest<'_>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut request = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body);
        if let Some(t) = timeout {
            request = request.timeout(t);
        }
        let resp = request.send().await.map_err(ProviderError::from_transport)?;
        if !resp.status().is_success() {
            return Err(status_error(VENDOR, resp).await);
        }
        Ok(resp)
    }
}

fn parse_response(resp: MessagesResponse) -> ChatResult {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in resp.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::new(id, name, input))
            }
            ContentBlock::Other => {}
        }
    }
    let usage = resp
        .usage
        .map(|u| Usage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        })
        .unwrap_or_default();

    ChatResult {
        text,
        tool_calls,
        usage,
        finish_reason: resp.stop_reason,
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        VENDOR
    }

    fn embedding_model(&self) -> &str {
        self.embeddings.model()
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &ChatOptions,
    ) -> Result<ChatResult, ProviderError> {
        let body = self.build_request(messages, tools, options, false);
        debug!(model = %self.model, tools = tools.len(), "anthropic chat request");
        let resp = self.post(&body, Some(self.timeout)).await?;
        let parsed: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(parse_response(parsed))
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &ChatOptions,
    ) -> Result<EventStream, ProviderError> {
        let body = self.build_request(messages, tools, options, true);
        debug!(model = %self.model, tools = tools.len(), "anthropic stream request");
        // a reqwest timeout would also cap the body, so only bound the headers
        let resp = tokio::time::timeout(self.timeout, self.post(&body, None))
            .await
            .map_err(|_| ProviderError::Timeout)??;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(sse::drive(
            Box::pin(resp.bytes_stream()),
            AnthropicStreamParser::default(),
            self.timeout,
            tx,
        ));
        Ok(rx)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, ProviderError> {
        self.embeddings.embed_batch(texts).await
    }
}

// ============ Stream parsing ============

#[derive(Debug, Default)]
struct OpenBlock {
    id: String,
    name: String,
    partial_json: String,
}

/// Tracks open `tool_use` blocks by content index; a block becomes a
/// [`ToolCall`] at `content_block_stop` and all calls are flushed together
/// at `message_stop`. Input tokens arrive in `message_start`, output
/// tokens in `message_delta`.
#[derive(Debug, Default)]
pub(crate) struct AnthropicStreamParser {
    open: BTreeMap<u64, OpenBlock>,
    completed: Vec<ToolCall>,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    finished: bool,
}

impl AnthropicStreamParser {
    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        // blocks never closed by content_block_stop still count
        let unclosed: Vec<u64> = self.open.keys().copied().collect();
        for index in unclosed {
            self.close(index);
        }

        let mut events = Vec::new();
        if !self.completed.is_empty() {
            events.push(StreamEvent::ToolCalls(std::mem::take(&mut self.completed)));
        }
        if self.input_tokens.is_some() || self.output_tokens.is_some() {
            let prompt = self.input_tokens.unwrap_or(0);
            let completion = self.output_tokens.unwrap_or(0);
            events.push(StreamEvent::Usage(Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            }));
        }
        events.push(StreamEvent::Done);
        events
    }

    fn close(&mut self, index: u64) {
        if let Some(block) = self.open.remove(&index) {
            self.completed.push(ToolCall {
                id: block.id,
                name: block.name,
                arguments: decode_arguments(&block.partial_json),
            });
        }
    }
}

impl StreamParser for AnthropicStreamParser {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>, ProviderError> {
        let json: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                debug!("skipping malformed SSE JSON: {e}");
                return Ok(Vec::new());
            }
        };
        let kind = frame
            .event
            .as_deref()
            .or_else(|| json.get("type").and_then(|t| t.as_str()))
            .unwrap_or_default();
        let index = json.get("index").and_then(|i| i.as_u64()).unwrap_or(0);

        match kind {
            "message_start" => {
                if let Some(n) = token_count(&json, "/message/usage/input_tokens") {
                    self.input_tokens = Some(n);
                }
                if let Some(n) = token_count(&json, "/message/usage/output_tokens") {
                    self.output_tokens = Some(n);
                }
                Ok(Vec::new())
            }
            "message_delta" => {
                // cumulative, so the last one wins
                if let Some(n) = token_count(&json, "/usage/output_tokens") {
                    self.output_tokens = Some(n);
                }
                if let Some(n) = token_count(&json, "/usage/input_tokens") {
                    self.input_tokens = Some(n);
                }
                Ok(Vec::new())
            }
            "content_block_start" => {
                let block = &json["content_block"];
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                    self.open.insert(
                        index,
                        OpenBlock {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            partial_json: String::new(),
                        },
                    );
                }
                Ok(Vec::new())
            }
            "content_block_delta" => {
                let delta = &json["delta"];
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if text.is_empty() {
                            Ok(Vec::new())
                        } else {
                            Ok(vec![StreamEvent::TextDelta(text.to_string())])
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(block) = self.open.get_mut(&index) {
                            block
                                .partial_json
                                .push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                        Ok(Vec::new())
                    }
                    _ => Ok(Vec::new()),
                }
            }
            "content_block_stop" => {
                self.close(index);
                Ok(Vec::new())
            }
            "message_stop" => Ok(self.finish()),
            "error" => Err(ProviderError::Api {
                vendor: VENDOR,
                status: 502,
                message: json
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("stream error")
                    .to_string(),
            }),
            _ => Ok(Vec::new()),
        }
    }

    fn on_end(&mut self) -> Result<Vec<StreamEvent>, ProviderError> {
        if self.finished {
            Ok(Vec::new())
        } else {
            Err(ProviderError::Decode("stream ended early".to_string()))
        }
    }
}

fn token_count(json: &Value, pointer: &str) -> Option<u32> {
    json.pointer(pointer)
        .and_then(|n| n.as_u64())
        .map(|n| n.min(u32::MAX as u64) as u32)
}
