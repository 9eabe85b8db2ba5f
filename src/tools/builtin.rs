//! The five built-in tools.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::page::extract_page;
use super::{Tool, ToolContext, ESCALATE_TOOL};
use crate::models::FileStatus;

const DEFAULT_SEARCH_LIMIT: usize = 5;
const MAX_SEARCH_LIMIT: usize = 20;

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

// ============ search_knowledge_base ============

pub struct SearchKnowledgeBaseTool;

#[async_trait]
impl Tool for SearchKnowledgeBaseTool {
    fn name(&self) -> &str {
        "search_knowledge_base"
    }

    fn description(&self) -> &str {
        "Search the knowledge base for relevant information. Use this when the user asks questions that might be answered by uploaded documents."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query to find relevant knowledge base content"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of results to return (default: 5)",
                    "default": DEFAULT_SEARCH_LIMIT
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let query = args
            .get("query")
            .and_then(|q| q.as_str())
            .unwrap_or("")
            .trim();
        if query.is_empty() {
            return Ok(json!({ "error": "Query is required" }));
        }
        let limit = args
            .get("limit")
            .and_then(|l| l.as_u64())
            .map(|l| (l as usize).clamp(1, MAX_SEARCH_LIMIT))
            .unwrap_or(DEFAULT_SEARCH_LIMIT);

        let results = ctx.retriever.search(query, limit).await?;
        if results.is_empty() {
            return Ok(json!({ "message": "No relevant information found in the knowledge base." }));
        }

        let entries: Vec<Value> = results
            .into_iter()
            .map(|r| {
                json!({
                    "content": r.content,
                    "source": r.source,
                    "relevance": round4(r.score),
                })
            })
            .collect();
        Ok(Value::Array(entries))
    }
}

// ============ get_business_info ============

pub struct GetBusinessInfoTool;

#[async_trait]
impl Tool for GetBusinessInfoTool {
    fn name(&self) -> &str {
        "get_business_info"
    }

    fn description(&self) -> &str {
        "Get general business information including name, description, contact details, and hours. Use when users ask about the company, contact info, or business hours."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let business = &ctx.config.business;
        let mut info = Map::new();
        for (key, value) in [
            ("name", &business.name),
            ("description", &business.description),
            ("contact", &business.contact),
            ("hours", &business.hours),
            ("additional", &business.extra),
            ("site_url", &ctx.config.widget.base_url),
        ] {
            if !value.trim().is_empty() {
                info.insert(key.to_string(), Value::String(value.clone()));
            }
        }

        if info.is_empty() {
            return Ok(json!({ "message": "No business information has been configured." }));
        }
        Ok(Value::Object(info))
    }
}

// ============ get_page_context ============

pub struct GetPageContextTool;

#[async_trait]
impl Tool for GetPageContextTool {
    fn name(&self) -> &str {
        "get_page_context"
    }

    fn description(&self) -> &str {
        "Get information about the page the user is currently viewing. Returns the page title, headings, and text content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL of the page to get context for"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let raw = args.get("url").and_then(|u| u.as_str()).unwrap_or("").trim();
        if raw.is_empty() {
            return Ok(json!({ "error": "URL is required" }));
        }
        let parsed = match url::Url::parse(raw) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => u,
            _ => return Ok(json!({ "error": format!("Invalid URL: {}", raw) })),
        };

        let mut context = Map::new();
        context.insert("url".into(), json!(raw));
        context.insert("path".into(), json!(parsed.path()));

        // a failed fetch still returns url and path
        match ctx.pages.fetch(parsed.as_str()).await {
            Ok(html) => {
                let page = extract_page(&html);
                context.insert("page_title".into(), json!(page.title));
                context.insert("headings".into(), json!(page.headings));
                context.insert("text_content".into(), json!(page.text));
            }
            Err(e) => warn!(url = %raw, "page fetch failed: {e:#}"),
        }

        Ok(Value::Object(context))
    }
}

// ============ list_knowledge_topics ============

pub struct ListKnowledgeTopicsTool;

#[async_trait]
impl Tool for ListKnowledgeTopicsTool {
    fn name(&self) -> &str {
        "list_knowledge_topics"
    }

    fn description(&self) -> &str {
        "List available knowledge base files and their topics. Use this to understand what information is available before searching."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let files = ctx.store.list_files(Some(FileStatus::Ready)).await?;
        if files.is_empty() {
            return Ok(json!({ "message": "No knowledge base files are available." }));
        }

        let topics: Vec<Value> = files
            .iter()
            .map(|f| {
                json!({
                    "name": f.original_name,
                    "chunks": f.chunk_count,
                    "type": f.mime_type,
                })
            })
            .collect();
        Ok(json!({
            "available_files": topics,
            "total_files": files.len(),
        }))
    }
}

// ============ escalate ============

pub struct EscalateTool;

#[async_trait]
impl Tool for EscalateTool {
    fn name(&self) -> &str {
        ESCALATE_TOOL
    }

    fn description(&self) -> &str {
        "Escalate the conversation for human review. Use this when you cannot adequately help the user, they request to speak with a human, or the issue requires human intervention."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Brief reason for the escalation"
                }
            },
            "required": ["reason"]
        })
    }

    async fn execute(&self, args: &Map<String, Value>, _ctx: &ToolContext) -> Result<Value> {
        let reason = args
            .get("reason")
            .and_then(|r| r.as_str())
            .filter(|r| !r.trim().is_empty())
            .unwrap_or("User requested human assistance");

        info!(reason, "conversation escalated");

        Ok(json!({
            "status": "escalated",
            "reason": reason,
            "message": "This conversation has been flagged for human review. A team member will follow up as soon as possible.",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KnowledgeChunk, KnowledgeFile};
    use crate::retrieval::Retriever;
    use crate::store::{InMemoryStore, Store};
    use crate::testing::{test_config, StaticPages, StubProvider};
    use std::sync::Arc;

    fn ctx_with(store: Arc<InMemoryStore>, pages: StaticPages) -> ToolContext {
        let store: Arc<dyn Store> = store;
        let mut config = test_config();
        config.business.name = "Acme Bikes".into();
        config.business.hours = "Mon-Fri 9-5".into();
        ToolContext::new(
            Arc::new(config),
            store.clone(),
            Arc::new(Retriever::new(store, Arc::new(StubProvider::default()))),
            Arc::new(pages),
        )
    }

    async fn seed_ready_file(store: &InMemoryStore) {
        let mut file = KnowledgeFile::new("blob.txt", "returns.txt", "text/plain", 42);
        file.status = FileStatus::Ready;
        file.chunk_count = 1;
        store.insert_file(&file).await.unwrap();
        let chunk = KnowledgeChunk::new(
            &file.id,
            0,
            "Bikes can be returned within 30 days with a receipt.".into(),
            json!({"filename": "returns.txt", "overlap_words": 0, "hash": "h"}),
        );
        store.insert_chunks(&[chunk]).await.unwrap();
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_search_falls_back_to_keywords() {
        let store = Arc::new(InMemoryStore::new());
        seed_ready_file(&store).await;
        let ctx = ctx_with(store, StaticPages::default());

        let out = SearchKnowledgeBaseTool
            .execute(&args(json!({"query": "returned receipt"})), &ctx)
            .await
            .unwrap();
        let entries = out.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["source"], "returns.txt");
    }

    #[tokio::test]
    async fn test_search_without_results_or_query() {
        let ctx = ctx_with(Arc::new(InMemoryStore::new()), StaticPages::default());
        let out = SearchKnowledgeBaseTool
            .execute(&args(json!({"query": "warranty"})), &ctx)
            .await
            .unwrap();
        assert_eq!(
            out["message"],
            "No relevant information found in the knowledge base."
        );
        let out = SearchKnowledgeBaseTool
            .execute(&Map::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(out["error"], "Query is required");
    }

    #[tokio::test]
    async fn test_business_info_filters_empty_fields() {
        let ctx = ctx_with(Arc::new(InMemoryStore::new()), StaticPages::default());
        let out = GetBusinessInfoTool.execute(&Map::new(), &ctx).await.unwrap();
        assert_eq!(out["name"], "Acme Bikes");
        assert_eq!(out["hours"], "Mon-Fri 9-5");
        assert!(out.get("contact").is_none());
    }

    #[tokio::test]
    async fn test_list_topics_only_ready_files() {
        let store = Arc::new(InMemoryStore::new());
        seed_ready_file(&store).await;
        store
            .insert_file(&KnowledgeFile::new("b.pdf", "draft.pdf", "application/pdf", 9))
            .await
            .unwrap();
        let ctx = ctx_with(store, StaticPages::default());

        let out = ListKnowledgeTopicsTool
            .execute(&Map::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(out["total_files"], 1);
        assert_eq!(out["available_files"][0]["name"], "returns.txt");
        assert_eq!(out["available_files"][0]["chunks"], 1);
    }

    #[tokio::test]
    async fn test_page_context_extracts_and_survives_fetch_failure() {
        let pages = StaticPages::default().with_page(
            "https://acme.example/pricing",
            "<html><head><title>Pricing</title></head><body><h1>Plans</h1><p>Basic is $10.</p></body></html>",
        );
        let ctx = ctx_with(Arc::new(InMemoryStore::new()), pages);

        let out = GetPageContextTool
            .execute(&args(json!({"url": "https://acme.example/pricing"})), &ctx)
            .await
            .unwrap();
        assert_eq!(out["path"], "/pricing");
        assert_eq!(out["page_title"], "Pricing");
        assert_eq!(out["headings"][0], "Plans");

        let out = GetPageContextTool
            .execute(&args(json!({"url": "https://acme.example/missing"})), &ctx)
            .await
            .unwrap();
        assert_eq!(out["path"], "/missing");
        assert!(out.get("page_title").is_none());

        let out = GetPageContextTool
            .execute(&args(json!({"url": "ftp://acme.example"})), &ctx)
            .await
            .unwrap();
        assert!(out.get("error").is_some());
    }

    #[tokio::test]
    async fn test_escalate_payload() {
        let ctx = ctx_with(Arc::new(InMemoryStore::new()), StaticPages::default());
        let out = EscalateTool
            .execute(&args(json!({"reason": "billing dispute"})), &ctx)
            .await
            .unwrap();
        assert_eq!(out["status"], "escalated");
        assert_eq!(out["reason"], "billing dispute");

        let out = EscalateTool.execute(&Map::new(), &ctx).await.unwrap();
        assert_eq!(out["reason"], "User requested human assistance");
    }
}
