//! Two-phase agent: route, then synthesize.
//!
//! ```text
//! user message
//!     │
//!     ▼
//! ┌─────────── Routing (all tools advertised, routing temperature) ─────────┐
//! │  text "[OFF_TOPIC]", no calls  → fallback message, done                 │
//! │  text "[GREETING]",  no calls  → greeting prompt, no tools              │
//! │  no marker,          no calls  → implicit search_knowledge_base(query)  │
//! │  tool calls                    → execute via ToolRegistry               │
//! └──────────────────────────────────────┬──────────────────────────────────┘
//!                                        ▼
//!        Synthesizing (no tools, tool results as labeled context)
//! ```
//!
//! [`Agent::process_message`] returns the finished reply.
//! [`Agent::stream_message`] runs the same pipeline on a spawned task and
//! reports progress as [`AgentEvent`]s; routing is never streamed because
//! the tool selection has to be complete before anything executes.
//!
//! Markers are only honored when the routing call requested no tools, and
//! are matched case-insensitively anywhere in the text.

pub mod prompt;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::FileStatus;
use crate::provider::{
    ChatMessage, ChatOptions, ChatProvider, ChatResult, ProviderError, StreamEvent, ToolCall,
    Usage, STREAM_BUFFER,
};
use crate::tools::{ToolContext, ToolOutcome, ToolRegistry};

use prompt::{
    greeting_prompt, routing_prompt, synthesis_prompt, with_history, GREETING_MARKER,
    OFF_TOPIC_MARKER, ROUTING_HISTORY, SYNTHESIS_HISTORY,
};

/// Id given to the search call the agent adds when routing selected nothing.
pub const FALLBACK_CALL_ID: &str = "fallback_kb_search";
const FALLBACK_SEARCH_LIMIT: u64 = 5;
const GREETING_FALLBACK: &str = "Hello! How can I help you?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Greeting,
    OffTopic,
    Tools,
}

/// Outcome of the routing call.
#[derive(Debug, Clone)]
pub struct Routing {
    pub route: Route,
    /// Calls to execute; empty unless `route` is [`Route::Tools`].
    pub calls: Vec<ToolCall>,
    pub usage: Usage,
}

/// Decide the route from a routing response.
///
/// With no tool calls the text is a classification marker. Anything that
/// is neither marker still gets grounded: a search with the raw user
/// message as the query.
pub fn classify(result: ChatResult, user_message: &str) -> Routing {
    if !result.tool_calls.is_empty() {
        return Routing {
            route: Route::Tools,
            calls: result.tool_calls,
            usage: result.usage,
        };
    }

    let text = result.text.trim().to_lowercase();
    let route = if text.contains(OFF_TOPIC_MARKER) {
        Route::OffTopic
    } else if text.contains(GREETING_MARKER) {
        Route::Greeting
    } else {
        debug!("routing selected no tools, falling back to knowledge base search");
        return Routing {
            route: Route::Tools,
            calls: vec![ToolCall::new(
                FALLBACK_CALL_ID,
                "search_knowledge_base",
                json!({ "query": user_message, "limit": FALLBACK_SEARCH_LIMIT }),
            )],
            usage: result.usage,
        };
    };

    Routing {
        route,
        calls: Vec::new(),
        usage: result.usage,
    }
}

/// A finished turn.
#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolOutcome>,
    /// Summed over every provider call that reported usage.
    pub usage: Usage,
}

#[derive(Debug)]
pub enum AgentEvent {
    TextDelta(String),
    /// Emitted for each selected call before any of them runs.
    ToolCall(ToolCall),
    /// Emitted after execution, in call order.
    ToolResult(ToolOutcome),
    /// Terminal. `text` is the concatenation of every `TextDelta`.
    Done(AgentReply),
    /// Terminal.
    Failed(ProviderError),
}

#[derive(Clone)]
pub struct Agent {
    config: Arc<Config>,
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
}

impl Agent {
    pub fn new(
        config: Arc<Config>,
        provider: Arc<dyn ChatProvider>,
        tools: Arc<ToolRegistry>,
        ctx: Arc<ToolContext>,
    ) -> Self {
        Self {
            config,
            provider,
            tools,
            ctx,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    fn synthesis_options(&self) -> ChatOptions {
        ChatOptions::with_temperature(self.config.agent.temperature)
    }

    /// Phase 1: classify the message and pick tools.
    pub async fn route(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        page_url: Option<&str>,
    ) -> Result<Routing, ProviderError> {
        let files = match self.ctx.store.list_files(Some(FileStatus::Ready)).await {
            Ok(files) => files,
            Err(e) => {
                warn!("could not list knowledge files for routing: {e:#}");
                Vec::new()
            }
        };

        let messages = with_history(
            routing_prompt(&self.config, &files, page_url),
            history,
            ROUTING_HISTORY,
            user_message,
        );
        let result = self
            .provider
            .chat(
                &messages,
                &self.tools.schemas(),
                &ChatOptions::with_temperature(self.config.agent.routing_temperature),
            )
            .await?;

        let routing = classify(result, user_message);
        info!(
            route = ?routing.route,
            calls = routing.calls.len(),
            "message routed"
        );
        Ok(routing)
    }

    fn greeting_messages(&self, user_message: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
        with_history(
            greeting_prompt(&self.config),
            history,
            SYNTHESIS_HISTORY,
            user_message,
        )
    }

    fn synthesis_messages(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        outcomes: &[ToolOutcome],
        page_url: Option<&str>,
    ) -> Vec<ChatMessage> {
        with_history(
            synthesis_prompt(&self.config, outcomes, page_url),
            history,
            SYNTHESIS_HISTORY,
            user_message,
        )
    }

    /// Run both phases and return the final answer.
    pub async fn process_message(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        page_url: Option<&str>,
    ) -> Result<AgentReply, ProviderError> {
        let routing = self.route(user_message, history, page_url).await?;
        let mut usage = routing.usage;

        match routing.route {
            Route::OffTopic => Ok(AgentReply {
                text: self.config.restrictions.fallback_message.clone(),
                usage,
                ..Default::default()
            }),
            Route::Greeting => {
                let messages = self.greeting_messages(user_message, history);
                let result = self
                    .provider
                    .chat(&messages, &[], &self.synthesis_options())
                    .await?;
                usage.merge(&result.usage);
                Ok(AgentReply {
                    text: or_fallback(result.text, GREETING_FALLBACK),
                    usage,
                    ..Default::default()
                })
            }
            Route::Tools => {
                let outcomes = self.tools.execute_calls(&routing.calls, &self.ctx).await;
                let messages =
                    self.synthesis_messages(user_message, history, &outcomes, page_url);
                let result = self
                    .provider
                    .chat(&messages, &[], &self.synthesis_options())
                    .await?;
                usage.merge(&result.usage);
                Ok(AgentReply {
                    text: or_fallback(result.text, &self.config.restrictions.error_message),
                    tool_calls: routing.calls,
                    tool_results: outcomes,
                    usage,
                })
            }
        }
    }

    /// Run both phases on a background task, reporting progress as events.
    ///
    /// The channel holds one event; dropping the receiver stops the task at
    /// its next send and closes the provider stream with it.
    pub fn stream_message(
        &self,
        user_message: String,
        history: Vec<ChatMessage>,
        page_url: Option<String>,
    ) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let agent = self.clone();
        tokio::spawn(async move {
            let outcome = agent
                .run_stream(&user_message, &history, page_url.as_deref(), &tx)
                .await;
            match outcome {
                Ok(Some(reply)) => {
                    let _ = tx.send(AgentEvent::Done(reply)).await;
                }
                Ok(None) => debug!("stream consumer went away"),
                Err(e) => {
                    warn!("streamed turn failed: {e}");
                    let _ = tx.send(AgentEvent::Failed(e)).await;
                }
            }
        });
        rx
    }

    /// `Ok(None)` when the consumer disconnected.
    async fn run_stream(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        page_url: Option<&str>,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<Option<AgentReply>, ProviderError> {
        let routing = self.route(user_message, history, page_url).await?;
        let mut usage = routing.usage;

        match routing.route {
            Route::OffTopic => {
                let text = self.config.restrictions.fallback_message.clone();
                if tx.send(AgentEvent::TextDelta(text.clone())).await.is_err() {
                    return Ok(None);
                }
                Ok(Some(AgentReply {
                    text,
                    usage,
                    ..Default::default()
                }))
            }
            Route::Greeting => {
                let messages = self.greeting_messages(user_message, history);
                let streamed = self.forward(&messages, GREETING_FALLBACK, tx).await?;
                Ok(streamed.map(|(text, greeting)| {
                    usage.merge(&greeting);
                    AgentReply {
                        text,
                        usage,
                        ..Default::default()
                    }
                }))
            }
            Route::Tools => {
                for call in &routing.calls {
                    if tx.send(AgentEvent::ToolCall(call.clone())).await.is_err() {
                        return Ok(None);
                    }
                }
                let outcomes = self.tools.execute_calls(&routing.calls, &self.ctx).await;
                for outcome in &outcomes {
                    if tx.send(AgentEvent::ToolResult(outcome.clone())).await.is_err() {
                        return Ok(None);
                    }
                }

                let messages =
                    self.synthesis_messages(user_message, history, &outcomes, page_url);
                let streamed = self
                    .forward(&messages, &self.config.restrictions.error_message, tx)
                    .await?;
                Ok(streamed.map(|(text, synthesis)| {
                    usage.merge(&synthesis);
                    AgentReply {
                        text,
                        tool_calls: routing.calls,
                        tool_results: outcomes,
                        usage,
                    }
                }))
            }
        }
    }

    /// Stream a tool-less completion into `tx`, returning the full text and
    /// the call's usage.
    async fn forward(
        &self,
        messages: &[ChatMessage],
        fallback: &str,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<Option<(String, Usage)>, ProviderError> {
        let mut events = self
            .provider
            .stream(messages, &[], &self.synthesis_options())
            .await?;

        let mut text = String::new();
        let mut usage = Usage::default();
        while let Some(event) = events.recv().await {
            match event? {
                StreamEvent::TextDelta(delta) if delta.is_empty() => {}
                StreamEvent::TextDelta(delta) => {
                    text.push_str(&delta);
                    if tx.send(AgentEvent::TextDelta(delta)).await.is_err() {
                        return Ok(None);
                    }
                }
                // no tools were advertised
                StreamEvent::ToolCalls(_) => {}
                StreamEvent::Usage(u) => usage.merge(&u),
                StreamEvent::Done => break,
            }
        }

        if text.is_empty() {
            text = fallback.to_string();
            if tx.send(AgentEvent::TextDelta(text.clone())).await.is_err() {
                return Ok(None);
            }
        }
        Ok(Some((text, usage)))
    }
}

fn or_fallback(text: String, fallback: &str) -> String {
    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::Role;
    use crate::retrieval::Retriever;
    use crate::store::{InMemoryStore, Store};
    use crate::testing::{test_config, StaticPages, StubProvider};

    fn text(t: &str) -> ChatResult {
        ChatResult {
            text: t.to_string(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            ..Default::default()
        }
    }

    fn calls(calls: Vec<ToolCall>) -> ChatResult {
        ChatResult {
            tool_calls: calls,
            ..Default::default()
        }
    }

    fn agent_with(config: Config, provider: Arc<StubProvider>) -> Agent {
        let config = Arc::new(config);
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let retriever = Arc::new(Retriever::new(store.clone(), provider.clone()));
        let ctx = Arc::new(ToolContext::new(
            config.clone(),
            store,
            retriever,
            Arc::new(StaticPages::default()),
        ));
        let tools = Arc::new(ToolRegistry::with_builtins(&config));
        Agent::new(config, provider, tools, ctx)
    }

    fn agent(provider: Arc<StubProvider>) -> Agent {
        agent_with(test_config(), provider)
    }

    async fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    #[test]
    fn test_classify_markers_case_insensitive() {
        assert_eq!(classify(text("[Off_Topic]"), "x").route, Route::OffTopic);
        assert_eq!(classify(text("  [GREETING]\n"), "x").route, Route::Greeting);
        assert_eq!(
            classify(text("sure: [greeting] it is"), "x").route,
            Route::Greeting
        );
    }

    #[test]
    fn test_classify_ignores_markers_when_tools_called() {
        let mut result = text("[OFF_TOPIC]");
        result.tool_calls = vec![ToolCall::new("c1", "get_business_info", json!({}))];
        let routing = classify(result, "hours?");
        assert_eq!(routing.route, Route::Tools);
        assert_eq!(routing.calls[0].name, "get_business_info");
    }

    #[test]
    fn test_classify_fallback_search() {
        let routing = classify(ChatResult::default(), "do you ship to Peru?");
        assert_eq!(routing.route, Route::Tools);
        assert_eq!(routing.calls.len(), 1);
        let call = &routing.calls[0];
        assert_eq!(call.id, FALLBACK_CALL_ID);
        assert_eq!(call.name, "search_knowledge_base");
        assert_eq!(call.str_arg("query"), Some("do you ship to Peru?"));
        assert_eq!(call.arguments["limit"], json!(5));
    }

    #[tokio::test]
    async fn test_off_topic_skips_synthesis() {
        let provider = Arc::new(StubProvider::with_replies(vec![text("[OFF_TOPIC]")]));
        let agent = agent(provider.clone());
        let reply = agent.process_message("who won the election?", &[], None).await.unwrap();

        assert_eq!(reply.text, test_config().restrictions.fallback_message);
        assert!(reply.tool_calls.is_empty());
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_greeting_uses_no_tools() {
        let provider = Arc::new(StubProvider::with_replies(vec![
            text("[GREETING]"),
            text("Hi there! How can I help?"),
        ]));
        let agent = agent(provider.clone());
        let reply = agent.process_message("hi there", &[], None).await.unwrap();

        assert_eq!(reply.text, "Hi there! How can I help?");
        assert!(reply.tool_calls.is_empty());
        assert!(reply.tool_results.is_empty());
        assert_eq!(reply.usage.total_tokens, 30);

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].tools.is_empty());
        assert!(requests[1].tools.is_empty());
        assert!(requests[1].messages[0].content.contains("1-2 sentences"));
    }

    #[tokio::test]
    async fn test_tools_then_synthesis() {
        let provider = Arc::new(StubProvider::with_replies(vec![
            calls(vec![ToolCall::new("c1", "get_business_info", json!({}))]),
            text("We are Acme."),
        ]));
        let mut config = test_config();
        config.business.name = "Acme".into();
        let agent = agent_with(config, provider.clone());

        let reply = agent
            .process_message("who are you?", &[], Some("https://acme.test/about"))
            .await
            .unwrap();
        assert_eq!(reply.text, "We are Acme.");
        assert_eq!(reply.tool_results.len(), 1);
        assert!(reply.tool_results[0].result.contains("Acme"));

        let requests = provider.requests();
        assert_eq!(requests[0].options.temperature, Some(0.3));
        assert_eq!(requests[1].options.temperature, Some(0.7));
        let system = &requests[1].messages[0].content;
        assert!(system.contains("--- Tool: get_business_info ---"));
        assert!(system.contains("The user is currently on page: https://acme.test/about"));
    }

    #[tokio::test]
    async fn test_history_truncated_per_phase() {
        let provider = Arc::new(StubProvider::with_replies(vec![
            calls(vec![ToolCall::new("c1", "list_knowledge_topics", json!({}))]),
            text("Nothing yet."),
        ]));
        let agent = agent(provider.clone());
        let history: Vec<ChatMessage> = (0..14)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                ChatMessage::new(role, format!("turn {}", i))
            })
            .collect();

        agent.process_message("what do you know?", &history, None).await.unwrap();
        let requests = provider.requests();
        assert_eq!(requests[0].messages.len(), 1 + ROUTING_HISTORY + 1);
        assert_eq!(requests[0].messages[1].content, "turn 4");
        assert_eq!(requests[1].messages.len(), 1 + SYNTHESIS_HISTORY + 1);
        assert_eq!(requests[1].messages[1].content, "turn 8");
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let provider = Arc::new(StubProvider::default().then_error(500));
        let agent = agent(provider);
        let err = agent.process_message("hello", &[], None).await.unwrap_err();
        assert_eq!(err.status(), 500);
    }

    #[tokio::test]
    async fn test_stream_matches_blocking_text() {
        let script = || {
            vec![
                calls(vec![ToolCall::new("c1", "get_business_info", json!({}))]),
                text("Our hours are nine to five on weekdays."),
            ]
        };
        let blocking = agent(Arc::new(StubProvider::with_replies(script())))
            .process_message("hours?", &[], None)
            .await
            .unwrap();

        let events = drain(
            agent(Arc::new(StubProvider::with_replies(script())))
                .stream_message("hours?".into(), Vec::new(), None),
        )
        .await;

        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, blocking.text);

        assert!(matches!(events[0], AgentEvent::ToolCall(_)));
        assert!(matches!(events[1], AgentEvent::ToolResult(_)));
        match events.last() {
            Some(AgentEvent::Done(reply)) => {
                assert_eq!(reply.text, blocking.text);
                assert_eq!(reply.tool_calls.len(), 1);
                assert_eq!(reply.usage, blocking.usage);
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_greeting_counts_both_calls() {
        let script = || vec![text("[GREETING]"), text("Hello! Ask me anything.")];
        let blocking = agent(Arc::new(StubProvider::with_replies(script())))
            .process_message("hey", &[], None)
            .await
            .unwrap();
        assert_eq!(blocking.usage.total_tokens, 30);

        let events = drain(
            agent(Arc::new(StubProvider::with_replies(script())))
                .stream_message("hey".into(), Vec::new(), None),
        )
        .await;
        match events.last() {
            Some(AgentEvent::Done(reply)) => {
                assert_eq!(reply.usage, blocking.usage);
                assert_eq!(reply.usage.prompt_tokens, 20);
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_off_topic_single_delta() {
        let provider = Arc::new(StubProvider::with_replies(vec![text("[OFF_TOPIC]")]));
        let events = drain(agent(provider).stream_message("politics".into(), Vec::new(), None)).await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            AgentEvent::TextDelta(d) => assert_eq!(d, &test_config().restrictions.fallback_message),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(events[1], AgentEvent::Done(_)));
    }

    #[tokio::test]
    async fn test_stream_routing_failure_is_terminal() {
        let provider = Arc::new(StubProvider::default().then_error(429));
        let events = drain(agent(provider).stream_message("hi".into(), Vec::new(), None)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AgentEvent::Failed(e) if e.status() == 429));
    }

    #[tokio::test]
    async fn test_empty_synthesis_uses_error_message() {
        let provider = Arc::new(StubProvider::with_replies(vec![
            calls(vec![ToolCall::new("c1", "get_business_info", json!({}))]),
            text(""),
        ]));
        let reply = agent(provider).process_message("?", &[], None).await.unwrap();
        assert_eq!(reply.text, test_config().restrictions.error_message);
    }
}
