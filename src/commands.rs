//! CLI command bodies. Each `run_*` prints a human summary to stdout.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::app::App;
use crate::chat::{ChatEvent, ChatRequest};
use crate::embedding;
use crate::extract::mime_for_path;
use crate::models::FileStatus;

fn date(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

pub async fn run_kb_add(app: &App, path: &Path, mime: Option<String>) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("path has no file name")?;
    let mime = mime.unwrap_or_else(|| mime_for_path(path).to_string());

    let file = app.ingestor.ingest(&bytes, &mime, name).await?;
    println!("kb add");
    println!("  id: {}", file.id);
    println!("  name: {}", file.original_name);
    println!("  type: {}", file.mime_type);
    println!("  chunks: {}", file.chunk_count);
    Ok(())
}

pub async fn run_kb_import(app: &App, dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }
    let summary = app.ingestor.import_dir(dir).await?;

    println!("kb import");
    println!("  files ingested: {}", summary.files_ok);
    println!("  files failed: {}", summary.files_failed);
    println!("  chunks: {}", summary.chunks);
    for (path, reason) in &summary.failures {
        println!("    {}: {}", path.display(), reason);
    }
    Ok(())
}

pub async fn run_kb_list(app: &App) -> Result<()> {
    let files = app.store.list_files(None).await?;
    if files.is_empty() {
        println!("No knowledge files.");
        return Ok(());
    }
    for file in files {
        println!(
            "{}  [{}] {} ({} chunks, {} bytes)",
            file.id, file.status, file.original_name, file.chunk_count, file.size
        );
        println!("    type: {}", file.mime_type);
        println!("    added: {}", date(file.created_at));
    }
    Ok(())
}

pub async fn run_kb_reprocess(app: &App, id: &str) -> Result<()> {
    let file = app.ingestor.reprocess(id).await?;
    println!("kb reprocess");
    println!("  {}: {} chunks", file.original_name, file.chunk_count);
    Ok(())
}

pub async fn run_kb_delete(app: &App, id: &str) -> Result<()> {
    app.ingestor.delete(id).await?;
    println!("Deleted {}.", id);
    Ok(())
}

pub async fn run_embed_pending(app: &App, limit: Option<usize>) -> Result<()> {
    let stats = embedding::embed_pending(
        app.provider.as_ref(),
        app.store.as_ref(),
        &app.config.embedding,
        limit,
    )
    .await?;

    println!("embed pending");
    if stats.embedded == 0 && stats.failed == 0 {
        println!("  all chunks up to date");
        return Ok(());
    }
    println!("  embedded: {}", stats.embedded);
    println!("  failed: {}", stats.failed);
    Ok(())
}

pub async fn run_embed_rebuild(app: &App) -> Result<()> {
    let (cleared, stats) =
        embedding::rebuild(app.provider.as_ref(), app.store.as_ref(), &app.config.embedding)
            .await?;
    println!("embed rebuild");
    println!("  cleared: {}", cleared);
    println!("  embedded: {}", stats.embedded);
    println!("  failed: {}", stats.failed);
    Ok(())
}

pub async fn run_search(app: &App, query: &str, limit: Option<usize>) -> Result<()> {
    let limit = limit.unwrap_or(app.config.retrieval.default_limit);
    let results = app.retriever.search(query, limit).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    let ready = app.store.list_files(Some(FileStatus::Ready)).await?.len();
    for (i, result) in results.iter().enumerate() {
        println!("{}. [{:.4}] {}", i + 1, result.score, result.source);
        let excerpt: String = result.content.chars().take(200).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    chunk: {}", result.chunk_id);
        println!();
    }
    println!("{} result(s) from {} ready file(s)", results.len(), ready);
    Ok(())
}

pub async fn run_chat(
    app: &App,
    message: String,
    session: Option<String>,
    page_url: Option<String>,
    stream: bool,
) -> Result<()> {
    let request = ChatRequest::new(session.unwrap_or_default(), message).with_page_url(page_url);

    if !stream {
        let reply = app.chat.send(request).await?;
        println!("{}", reply.text);
        println!();
        println!("  session: {}", reply.session_id);
        println!("  status: {}", reply.status.as_str());
        for reason in &reply.escalations {
            println!("  escalated: {}", reason);
        }
        return Ok(());
    }

    let mut events = app.chat.stream(request).await?;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::Token { delta } => {
                print!("{}", delta);
                stdout.flush()?;
            }
            ChatEvent::ToolCall { tool, .. } => println!("[searching: {}]", tool),
            ChatEvent::ToolResult { tool, status } => println!("[{}: {}]", tool, status),
            ChatEvent::Escalation { reason } => println!("\n[escalated: {}]", reason),
            ChatEvent::Error { message } => println!("\n[error] {}", message),
            ChatEvent::Done {
                session_id, status, ..
            } => {
                println!();
                println!();
                println!("  session: {}", session_id);
                println!("  status: {}", status.as_str());
            }
        }
    }
    Ok(())
}
