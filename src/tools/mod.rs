//! Tools the agent can call during routing.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      ToolRegistry                        │
//! │  search_knowledge_base  get_business_info                │
//! │  get_page_context       list_knowledge_topics            │
//! │  escalate (only when escalation is enabled)              │
//! └──────────────┬───────────────────────────────────────────┘
//!                ▼
//!     execute_calls() → [ToolOutcome] in call order
//! ```
//!
//! A tool returns a JSON value; the registry serializes it into the text
//! handed to the synthesis prompt. Failures never escape the registry:
//! an error, a timeout, or an unknown tool name becomes an
//! `{"error": "..."}` result for that call only.

pub mod builtin;
pub mod page;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::provider::{ToolCall, ToolSchema};
use crate::retrieval::Retriever;
use crate::store::Store;

pub use builtin::{
    EscalateTool, GetBusinessInfoTool, GetPageContextTool, ListKnowledgeTopicsTool,
    SearchKnowledgeBaseTool,
};
pub use page::{HttpPageFetcher, PageFetcher};

/// Name of the tool whose results flag a conversation for human review.
pub const ESCALATE_TOOL: &str = "escalate";

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable identifier the model calls the tool by.
    fn name(&self) -> &str;

    /// Shown to the model to guide tool selection.
    fn description(&self) -> &str;

    /// JSON Schema object for the arguments.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. `args` is always an object, possibly empty when the
    /// model's argument payload could not be decoded.
    async fn execute(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value>;
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Everything a tool may touch while it runs.
pub struct ToolContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub retriever: Arc<Retriever>,
    pub pages: Arc<dyn PageFetcher>,
}

impl ToolContext {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        retriever: Arc<Retriever>,
        pages: Arc<dyn PageFetcher>,
    ) -> Self {
        Self {
            config,
            store,
            retriever,
            pages,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Outcomes
// ═══════════════════════════════════════════════════════════════════════

/// Result of one executed call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub result: String,
}

impl ToolOutcome {
    fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result: json!({ "error": message.into() }).to_string(),
        }
    }

    /// True when the result text is a JSON object with an `error` key.
    pub fn is_error(&self) -> bool {
        serde_json::from_str::<Value>(&self.result)
            .map(|v| v.get("error").is_some())
            .unwrap_or(false)
    }

    pub fn is_escalation(&self) -> bool {
        self.name == ESCALATE_TOOL
    }

    /// The `reason` field of an escalation result, if present.
    pub fn escalation_reason(&self) -> Option<String> {
        if !self.is_escalation() {
            return None;
        }
        serde_json::from_str::<Value>(&self.result)
            .ok()
            .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(String::from))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: Vec::new(),
            timeout,
        }
    }

    /// The built-in set. `escalate` is registered only when escalation is
    /// enabled, so the model never sees it otherwise.
    pub fn with_builtins(config: &Config) -> Self {
        let mut registry = Self::new(Duration::from_secs(config.agent.tool_timeout_secs));
        registry.register(Box::new(SearchKnowledgeBaseTool));
        registry.register(Box::new(GetBusinessInfoTool));
        registry.register(Box::new(GetPageContextTool));
        registry.register(Box::new(ListKnowledgeTopicsTool));
        if config.escalation.enabled {
            registry.register(Box::new(EscalateTool));
        }
        registry
    }

    /// Register a tool, replacing any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Run every call concurrently and return outcomes in call order.
    pub async fn execute_calls(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolOutcome> {
        join_all(calls.iter().map(|call| self.execute_one(call, ctx))).await
    }

    async fn execute_one(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.find(&call.name) else {
            warn!(tool = %call.name, "model requested unknown tool");
            return ToolOutcome::error(call, format!("Unknown tool: {}", call.name));
        };

        let args_value = Value::Object(call.arguments.clone());
        debug!(tool = %call.name, args = %args_value, "executing tool");
        match tokio::time::timeout(self.timeout, tool.execute(&call.arguments, ctx)).await {
            Ok(Ok(value)) => ToolOutcome {
                call_id: call.id.clone(),
                name: call.name.clone(),
                result: match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
            },
            Ok(Err(e)) => {
                warn!(tool = %call.name, "tool failed: {e:#}");
                ToolOutcome::error(call, format!("Tool execution failed: {e}"))
            }
            Err(_) => {
                warn!(tool = %call.name, timeout_secs = self.timeout.as_secs(), "tool timed out");
                ToolOutcome::error(
                    call,
                    format!("Tool execution failed: timed out after {}s", self.timeout.as_secs()),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::Retriever;
    use crate::store::InMemoryStore;
    use crate::testing::{test_config, StaticPages, StubProvider};

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _args: &Map<String, Value>, _ctx: &ToolContext) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("late"))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _args: &Map<String, Value>, _ctx: &ToolContext) -> Result<Value> {
            anyhow::bail!("disk on fire")
        }
    }

    fn context(config: Config) -> ToolContext {
        let config = Arc::new(config);
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let provider = Arc::new(StubProvider::default());
        ToolContext::new(
            config,
            store.clone(),
            Arc::new(Retriever::new(store, provider)),
            Arc::new(StaticPages::default()),
        )
    }

    #[test]
    fn test_builtins_respect_escalation_flag() {
        let mut config = test_config();
        let names: Vec<String> = ToolRegistry::with_builtins(&config)
            .schemas()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "search_knowledge_base",
                "get_business_info",
                "get_page_context",
                "list_knowledge_topics",
                "escalate"
            ]
        );

        config.escalation.enabled = false;
        let registry = ToolRegistry::with_builtins(&config);
        assert_eq!(registry.len(), 4);
        assert!(registry.find(ESCALATE_TOOL).is_none());
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_ordered() {
        let ctx = context(test_config());
        let mut registry = ToolRegistry::new(Duration::from_millis(50));
        registry.register(Box::new(SlowTool));
        registry.register(Box::new(FailingTool));
        registry.register(Box::new(EscalateTool));

        let calls = vec![
            ToolCall::new("1", "slow", json!({})),
            ToolCall::new("2", "boom", json!({})),
            ToolCall::new("3", "nope", json!({})),
            ToolCall::new("4", "escalate", json!({"reason": "wants a human"})),
        ];
        let outcomes = registry.execute_calls(&calls, &ctx).await;

        let ids: Vec<&str> = outcomes.iter().map(|o| o.call_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        assert!(outcomes[0].result.contains("timed out"));
        assert!(outcomes[1].result.contains("Tool execution failed: disk on fire"));
        assert_eq!(outcomes[2].result, r#"{"error":"Unknown tool: nope"}"#);
        assert!(outcomes[..3].iter().all(|o| o.is_error()));
        assert!(!outcomes[3].is_error());
        assert_eq!(outcomes[3].escalation_reason().as_deref(), Some("wants a human"));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::new(Duration::from_secs(1));
        registry.register(Box::new(FailingTool));
        registry.register(Box::new(FailingTool));
        assert_eq!(registry.len(), 1);
    }
}
