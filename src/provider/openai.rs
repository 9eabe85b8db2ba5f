//! OpenAI chat completions and embeddings.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::sse::{self, SseFrame, StreamParser};
use super::{
    decode_arguments, http_client, status_error, ChatMessage, ChatOptions, ChatProvider,
    ChatResult, EventStream, GenerationDefaults, ProviderError, StreamEvent, ToolCall, ToolSchema,
    Usage, STREAM_BUFFER,
};

const VENDOR: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

// ============ Request wire types ============

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

// ============ Response wire types ============

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireCalledFunction,
}

#[derive(Debug, Deserialize)]
struct WireCalledFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    total_tokens: Option<u32>,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens.unwrap_or(u.prompt_tokens + u.completion_tokens),
        }
    }
}

// ============ Provider ============

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    defaults: GenerationDefaults,
    timeout: Duration,
    embeddings: OpenAiEmbeddings,
}

impl OpenAiProvider {
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

    /// Point at an OpenAI-compatible endpoint instead of api.openai.com.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_request<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        tools: &'a [ToolSchema],
        options: &ChatOptions,
        stream: bool,
    ) -> ChatRequestBody<'a> {
        let (temperature, max_tokens) = self.defaults.resolve(options);
        ChatRequestBody {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature,
            max_tokens,
            tools: tools
                .iter()
                .map(|t| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect(),
            tool_choice: (!tools.is_empty()).then_some("auto"),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn post(
        &self,
        body: &ChatRequestBody<'_>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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

fn parse_completion(resp: CompletionResponse) -> Result<ChatResult, ProviderError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Decode("response has no choices".to_string()))?;

    Ok(ChatResult {
        text: choice.message.content.unwrap_or_default(),
        tool_calls: choice
            .message
            .tool_calls
            .into_iter()
            .map(|c| ToolCall {
                id: c.id,
                name: c.function.name,
                arguments: decode_arguments(&c.function.arguments),
            })
            .collect(),
        usage: resp.usage.map(Usage::from).unwrap_or_default(),
        finish_reason: choice.finish_reason,
    })
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
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
        debug!(model = %self.model, tools = tools.len(), "openai chat request");
        let resp = self.post(&body, Some(self.timeout)).await?;
        let parsed: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        parse_completion(parsed)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &ChatOptions,
    ) -> Result<EventStream, ProviderError> {
        let body = self.build_request(messages, tools, options, true);
        debug!(model = %self.model, tools = tools.len(), "openai stream request");
        // a reqwest timeout would also cap the body, so only bound the headers
        let resp = tokio::time::timeout(self.timeout, self.post(&body, None))
            .await
            .map_err(|_| ProviderError::Timeout)??;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(sse::drive(
            Box::pin(resp.bytes_stream()),
            OpenAiStreamParser::default(),
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
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Buffers `delta.tool_calls` fragments by index, and the trailing usage
/// chunk, until `[DONE]`.
#[derive(Debug, Default)]
pub(crate) struct OpenAiStreamParser {
    pending: BTreeMap<u64, PendingCall>,
    usage: Option<Usage>,
    finished: bool,
}

impl OpenAiStreamParser {
    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let calls: Vec<ToolCall> = std::mem::take(&mut self.pending)
            .into_values()
            .map(|p| ToolCall {
                id: p.id,
                name: p.name,
                arguments: decode_arguments(&p.arguments),
            })
            .collect();

        let mut events = Vec::new();
        if !calls.is_empty() {
            events.push(StreamEvent::ToolCalls(calls));
        }
        if let Some(usage) = self.usage.take() {
            events.push(StreamEvent::Usage(usage));
        }
        events.push(StreamEvent::Done);
        events
    }
}

impl StreamParser for OpenAiStreamParser {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>, ProviderError> {
        let data = frame.data.trim();
        if data == "[DONE]" {
            return Ok(self.finish());
        }

        let json: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                debug!("skipping malformed SSE JSON: {e}");
                return Ok(Vec::new());
            }
        };

        if let Some(err) = json.get("error") {
            return Err(ProviderError::Api {
                vendor: VENDOR,
                status: 502,
                message: err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("stream error")
                    .to_string(),
            });
        }

        if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
            match serde_json::from_value::<WireUsage>(usage.clone()) {
                Ok(u) => self.usage = Some(u.into()),
                Err(e) => debug!("ignoring malformed stream usage: {e}"),
            }
        }

        let mut events = Vec::new();
        let Some(delta) = json.pointer("/choices/0/delta") else {
            return Ok(events);
        };

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta(text.to_string()));
            }
        }

        if let Some(fragments) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for fragment in fragments {
                let index = fragment.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let call = self.pending.entry(index).or_default();
                if let Some(id) = fragment.get("id").and_then(|v| v.as_str()) {
                    call.id = id.to_string();
                }
                if let Some(function) = fragment.get("function") {
                    if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                        call.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                        call.arguments.push_str(args);
                    }
                }
            }
        }

        Ok(events)
    }

    fn on_end(&mut self) -> Result<Vec<StreamEvent>, ProviderError> {
        if self.finished {
            Ok(Vec::new())
        } else {
            Err(ProviderError::Decode("stream ended early".to_string()))
        }
    }
}

// ============ Embeddings ============

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Client for `POST /v1/embeddings`, shared by both chat vendors.
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: Option<String>, model: String, timeout: Duration) -> Self {
        Self {
            client: http_client(),
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Option<Vec<f32>>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingCredential("openai embeddings"))?;

        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        if !resp.status().is_success() {
            return Err(status_error(VENDOR, resp).await);
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let placed = place_embeddings(texts.len(), parsed.data);
        info!(
            requested = texts.len(),
            returned = placed.iter().filter(|v| v.is_some()).count(),
            "embedded batch"
        );
        Ok(placed)
    }
}

/// Put each vector at its `index`, falling back to array position when the
/// vendor omits it. Out-of-range indices are dropped.
fn place_embeddings(len: usize, data: Vec<EmbeddingItem>) -> Vec<Option<Vec<f32>>> {
    let mut out = vec![None; len];
    for (position, item) in data.into_iter().enumerate() {
        let slot = item.index.unwrap_or(position);
        if let Some(entry) = out.get_mut(slot) {
            *entry = Some(item.embedding);
        }
    }
    out
}
