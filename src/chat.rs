//! Chat operations: send, stream, widget config, and escalation contact.
//!
//! Every turn passes the same admission checks, in order:
//!
//! 1. agent enabled with a credential, else [`ChatError::NotConfigured`]
//! 2. non-empty message, else [`ChatError::Validation`]
//! 3. per-session rate limit over the last minute, else [`ChatError::RateLimited`]
//! 4. conversation fetched or created
//! 5. per-conversation message cap, else a `closed` reply
//!
//! Only the first three reject before anything is written. Past admission
//! the user message is always persisted, and a provider failure becomes
//! the configured error message with status `error`.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentEvent, AgentReply};
use crate::config::Config;
use crate::error::ChatError;
use crate::models::{now_millis, Conversation, ConversationStatus, Message, Role};
use crate::provider::{ChatMessage, STREAM_BUFFER};
use crate::store::Store;
use crate::widget::WidgetConfigView;

/// User/assistant turns loaded as history for a new message.
pub const HISTORY_LIMIT: usize = 20;
const RATE_WINDOW_MILLIS: i64 = 60_000;

pub const CONVERSATION_CLOSED_TEXT: &str =
    "This conversation has reached its message limit. Please start a new conversation.";

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Empty means "start a new session".
    pub session_id: String,
    pub message: String,
    pub page_url: Option<String>,
    pub ip_address: Option<String>,
}

impl ChatRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_page_url(mut self, page_url: Option<String>) -> Self {
        self.page_url = page_url.filter(|u| !u.trim().is_empty());
        self
    }

    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Escalated,
    Closed,
    Error,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Escalated => "escalated",
            ReplyStatus::Closed => "closed",
            ReplyStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub text: String,
    pub session_id: String,
    /// Id of the persisted assistant message; absent for closed and failed turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub status: ReplyStatus,
    /// Reasons from every `escalate` call made during this turn.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub escalations: Vec<String>,
}

/// Client-facing stream events. `Done` is always last.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Token { delta: String },
    ToolCall { tool: String, args: Value },
    ToolResult { tool: String, status: &'static str },
    Escalation { reason: String },
    Error { message: String },
    Done {
        session_id: String,
        message_id: Option<String>,
        status: ReplyStatus,
    },
}

impl ChatEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Token { .. } => "token",
            ChatEvent::ToolCall { .. } => "tool_call",
            ChatEvent::ToolResult { .. } => "tool_result",
            ChatEvent::Escalation { .. } => "escalation",
            ChatEvent::Error { .. } => "error",
            ChatEvent::Done { .. } => "done",
        }
    }

    /// SSE data payload.
    pub fn data(&self) -> Value {
        match self {
            ChatEvent::Token { delta } => json!({ "delta": delta }),
            ChatEvent::ToolCall { tool, args } => json!({ "tool": tool, "args": args }),
            ChatEvent::ToolResult { tool, status } => json!({ "tool": tool, "status": status }),
            ChatEvent::Escalation { reason } => json!({ "reason": reason }),
            ChatEvent::Error { message } => json!({ "message": message }),
            ChatEvent::Done {
                session_id,
                message_id,
                status,
            } => json!({
                "sessionId": session_id,
                "messageId": message_id,
                "status": status.as_str(),
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ChatEvent::Done { .. })
    }
}

/// A turn that passed admission: user message stored, history loaded.
struct Turn {
    conversation: Conversation,
    message: String,
    page_url: Option<String>,
    history: Vec<ChatMessage>,
}

enum Admission {
    Closed(ChatReply),
    Open(Turn),
}

#[derive(Clone)]
pub struct ChatService {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    agent: Agent,
}

impl ChatService {
    pub fn new(config: Arc<Config>, store: Arc<dyn Store>, agent: Agent) -> Self {
        Self {
            config,
            store,
            agent,
        }
    }

    pub fn widget_config(&self) -> WidgetConfigView {
        WidgetConfigView::from_config(&self.config)
    }

    async fn admit(&self, request: &ChatRequest) -> Result<Admission, ChatError> {
        if !self.config.agent.is_configured() {
            return Err(ChatError::NotConfigured);
        }

        let message = request.message.trim();
        if message.is_empty() {
            return Err(ChatError::Validation("Message is required.".to_string()));
        }

        let session_id = match request.session_id.trim() {
            "" => Uuid::new_v4().to_string(),
            s => s.to_string(),
        };

        let since = now_millis() - RATE_WINDOW_MILLIS;
        let recent = self
            .store
            .count_recent_user_messages(&session_id, since)
            .await?;
        if recent >= self.config.restrictions.rate_limit_per_minute {
            warn!(session_id, recent, "rate limit exceeded");
            return Err(ChatError::RateLimited);
        }

        let conversation = self
            .store
            .get_or_create_conversation(
                &session_id,
                request.page_url.as_deref(),
                request.ip_address.as_deref(),
            )
            .await?;

        let total = self.store.count_user_messages(&conversation.id).await?;
        if total >= self.config.restrictions.max_messages_per_conversation {
            info!(conversation_id = %conversation.id, total, "conversation reached message cap");
            return Ok(Admission::Closed(ChatReply {
                text: CONVERSATION_CLOSED_TEXT.to_string(),
                session_id,
                message_id: None,
                status: ReplyStatus::Closed,
                escalations: Vec::new(),
            }));
        }

        let history = self
            .store
            .recent_history(&conversation.id, HISTORY_LIMIT)
            .await?
            .into_iter()
            .map(|m| ChatMessage::new(m.role, m.content.unwrap_or_default()))
            .collect();

        self.store
            .append_message(&Message::new(
                &conversation.id,
                Role::User,
                Some(message.to_string()),
            ))
            .await?;

        Ok(Admission::Open(Turn {
            conversation,
            message: message.to_string(),
            page_url: request.page_url.clone(),
            history,
        }))
    }

    /// Answer one message and persist the exchange.
    pub async fn send(&self, request: ChatRequest) -> Result<ChatReply, ChatError> {
        let turn = match self.admit(&request).await? {
            Admission::Closed(reply) => return Ok(reply),
            Admission::Open(turn) => turn,
        };

        match self
            .agent
            .process_message(&turn.message, &turn.history, turn.page_url.as_deref())
            .await
        {
            Ok(reply) => self.complete(&turn, reply).await,
            Err(e) => {
                error!(
                    conversation_id = %turn.conversation.id,
                    status = e.status(),
                    "chat turn failed: {e}"
                );
                Ok(self.failed_reply(&turn))
            }
        }
    }

    /// Answer one message as a live event stream.
    ///
    /// Admission failures are returned before the stream starts. If the
    /// receiver is dropped mid-answer, any text already produced is
    /// persisted as the assistant's turn.
    pub async fn stream(&self, request: ChatRequest) -> Result<mpsc::Receiver<ChatEvent>, ChatError> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        match self.admit(&request).await? {
            Admission::Closed(reply) => {
                tokio::spawn(async move {
                    if tx.send(ChatEvent::Token { delta: reply.text }).await.is_ok() {
                        let _ = tx
                            .send(ChatEvent::Done {
                                session_id: reply.session_id,
                                message_id: None,
                                status: ReplyStatus::Closed,
                            })
                            .await;
                    }
                });
            }
            Admission::Open(turn) => {
                let service = self.clone();
                tokio::spawn(async move { service.run_stream(turn, tx).await });
            }
        }
        Ok(rx)
    }

    async fn run_stream(&self, turn: Turn, tx: mpsc::Sender<ChatEvent>) {
        let mut events = self.agent.stream_message(
            turn.message.clone(),
            turn.history.clone(),
            turn.page_url.clone(),
        );
        let session_id = turn.conversation.session_id.clone();

        // Mirrors the agent's progress so an aborted stream can still be saved.
        let mut partial = AgentReply::default();

        while let Some(event) = events.recv().await {
            let outgoing = match event {
                AgentEvent::TextDelta(delta) => {
                    partial.text.push_str(&delta);
                    vec![ChatEvent::Token { delta }]
                }
                AgentEvent::ToolCall(call) => {
                    let out = ChatEvent::ToolCall {
                        tool: call.name.clone(),
                        args: Value::Object(call.arguments.clone()),
                    };
                    partial.tool_calls.push(call);
                    vec![out]
                }
                AgentEvent::ToolResult(outcome) => {
                    let mut out = vec![ChatEvent::ToolResult {
                        tool: outcome.name.clone(),
                        status: if outcome.is_error() { "error" } else { "ok" },
                    }];
                    if let Some(reason) = outcome.escalation_reason() {
                        out.push(ChatEvent::Escalation { reason });
                    }
                    partial.tool_results.push(outcome);
                    out
                }
                AgentEvent::Done(reply) => {
                    let done = match self.complete(&turn, reply).await {
                        Ok(reply) => ChatEvent::Done {
                            session_id,
                            message_id: reply.message_id,
                            status: reply.status,
                        },
                        Err(e) => {
                            error!(conversation_id = %turn.conversation.id, "failed to save streamed reply: {e:#}");
                            let _ = tx
                                .send(ChatEvent::Error {
                                    message: self.config.restrictions.error_message.clone(),
                                })
                                .await;
                            ChatEvent::Done {
                                session_id,
                                message_id: None,
                                status: ReplyStatus::Error,
                            }
                        }
                    };
                    let _ = tx.send(done).await;
                    return;
                }
                AgentEvent::Failed(e) => {
                    error!(
                        conversation_id = %turn.conversation.id,
                        status = e.status(),
                        "streamed chat turn failed: {e}"
                    );
                    let failed = self.failed_reply(&turn);
                    if tx
                        .send(ChatEvent::Error {
                            message: failed.text,
                        })
                        .await
                        .is_ok()
                    {
                        let _ = tx
                            .send(ChatEvent::Done {
                                session_id,
                                message_id: None,
                                status: ReplyStatus::Error,
                            })
                            .await;
                    }
                    return;
                }
            };

            for event in outgoing {
                if tx.send(event).await.is_err() {
                    drop(events);
                    self.abandon(&turn, partial).await;
                    return;
                }
            }
        }
    }

    /// The client went away mid-stream.
    async fn abandon(&self, turn: &Turn, partial: AgentReply) {
        if partial.text.is_empty() {
            info!(conversation_id = %turn.conversation.id, "stream aborted before any text");
            return;
        }
        info!(
            conversation_id = %turn.conversation.id,
            chars = partial.text.len(),
            "stream aborted, saving partial reply"
        );
        if let Err(e) = self.complete(turn, partial).await {
            warn!(conversation_id = %turn.conversation.id, "failed to save partial reply: {e:#}");
        }
    }

    fn failed_reply(&self, turn: &Turn) -> ChatReply {
        ChatReply {
            text: self.config.restrictions.error_message.clone(),
            session_id: turn.conversation.session_id.clone(),
            message_id: None,
            status: ReplyStatus::Error,
            escalations: Vec::new(),
        }
    }

    /// Record escalations and persist the assistant message.
    async fn complete(&self, turn: &Turn, reply: AgentReply) -> Result<ChatReply, ChatError> {
        let escalations: Vec<String> = reply
            .tool_results
            .iter()
            .filter_map(|o| o.escalation_reason())
            .collect();

        if let Some(last) = escalations.last() {
            self.mark_escalated(&turn.conversation, last).await?;
        }

        let tool_calls = if reply.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&reply.tool_calls).map_err(anyhow::Error::from)?)
        };
        let tool_results = if reply.tool_results.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&reply.tool_results).map_err(anyhow::Error::from)?)
        };
        let tokens = match reply.usage.total_tokens {
            0 => None,
            n => Some(n as i64),
        };

        let message = Message::new(&turn.conversation.id, Role::Assistant, Some(reply.text.clone()))
            .with_tool_calls(tool_calls)
            .with_tool_results(tool_results)
            .with_tokens(tokens);
        self.store.append_message(&message).await?;

        Ok(ChatReply {
            text: reply.text,
            session_id: turn.conversation.session_id.clone(),
            message_id: Some(message.id),
            status: if escalations.is_empty() {
                ReplyStatus::Ok
            } else {
                ReplyStatus::Escalated
            },
            escalations,
        })
    }

    async fn mark_escalated(&self, conversation: &Conversation, reason: &str) -> Result<(), ChatError> {
        // Re-read so a contact form submitted meanwhile is kept.
        let current = self
            .store
            .find_conversation(&conversation.session_id)
            .await?
            .map(|c| c.metadata)
            .unwrap_or_else(|| conversation.metadata.clone());
        let metadata = merged(&current, "escalation_reason", json!(reason));

        self.store
            .update_conversation(&conversation.id, ConversationStatus::Escalated, &metadata)
            .await?;
        info!(conversation_id = %conversation.id, reason, "conversation escalated");
        Ok(())
    }

    /// Attach contact details to a session's conversation and mark it escalated.
    pub async fn escalate_contact(&self, session_id: &str, contact: Value) -> Result<String, ChatError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(ChatError::Validation("Session ID required.".to_string()));
        }
        let contact = match contact {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            _ => {
                return Err(ChatError::Validation(
                    "Contact details must be an object.".to_string(),
                ))
            }
        };

        let conversation = self
            .store
            .find_conversation(session_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(session_id.to_string()))?;

        let metadata = merged(&conversation.metadata, "contact", contact.clone());
        self.store
            .update_conversation(&conversation.id, ConversationStatus::Escalated, &metadata)
            .await?;
        self.store
            .append_message(&Message::new(
                &conversation.id,
                Role::System,
                Some(format!("Escalation form submitted: {}", contact)),
            ))
            .await?;

        info!(conversation_id = %conversation.id, "escalation form submitted");
        Ok(self.config.escalation.confirmation.clone())
    }
}

fn merged(existing: &Value, key: &str, value: Value) -> Value {
    let mut map = match existing {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert(key.to_string(), value);
    Value::Object(map)
}
