//! # sitechat CLI
//!
//! ```bash
//! sitechat --config ./config/sitechat.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sitechat init` | Create the SQLite database, schema, and blob directory |
//! | `sitechat serve` | Start the HTTP server |
//! | `sitechat kb add <path>` | Ingest one document |
//! | `sitechat kb import <dir>` | Ingest every document under a directory |
//! | `sitechat kb list` | List knowledge files and their status |
//! | `sitechat kb reprocess <id>` | Re-chunk and re-embed a file |
//! | `sitechat kb delete <id>` | Delete a file and its chunks |
//! | `sitechat embed pending` | Backfill missing or stale embeddings |
//! | `sitechat embed rebuild` | Delete and regenerate all embeddings |
//! | `sitechat search "<query>"` | Query the knowledge base |
//! | `sitechat chat "<message>"` | Run one chat turn |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sitechat::app::App;
use sitechat::{commands, config, migrate, server};

/// sitechat: a retrieval-augmented chat agent for websites.
///
/// All commands read a TOML configuration file given by `--config`.
#[derive(Parser)]
#[command(name = "sitechat", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sitechat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and blob directory. Safe to repeat.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Manage knowledge-base documents.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Search the knowledge base (vector search, keyword fallback).
    Search {
        query: String,

        /// Maximum number of results. Defaults to `[retrieval].default_limit`.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Send one message through the agent.
    Chat {
        message: String,

        /// Continue an existing session.
        #[arg(long)]
        session: Option<String>,

        /// Page the user is on, passed to the agent as context.
        #[arg(long)]
        page_url: Option<String>,

        /// Print tokens as they arrive.
        #[arg(long)]
        stream: bool,
    },
}

#[derive(Subcommand)]
enum KbAction {
    /// Ingest a single file.
    Add {
        path: PathBuf,

        /// Media type; inferred from the extension when omitted.
        #[arg(long)]
        mime: Option<String>,
    },
    /// Ingest every file under a directory.
    Import { dir: PathBuf },
    List,
    Reprocess { id: String },
    Delete { id: String },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing or stale.
    Pending {
        /// Maximum number of chunks to embed.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete all embeddings and regenerate them.
    Rebuild,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(&cfg.storage.blob_dir)?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(cfg).await?;
        }
        Commands::Kb { action } => {
            let app = App::build(cfg).await?;
            match action {
                KbAction::Add { path, mime } => commands::run_kb_add(&app, &path, mime).await?,
                KbAction::Import { dir } => commands::run_kb_import(&app, &dir).await?,
                KbAction::List => commands::run_kb_list(&app).await?,
                KbAction::Reprocess { id } => commands::run_kb_reprocess(&app, &id).await?,
                KbAction::Delete { id } => commands::run_kb_delete(&app, &id).await?,
            }
        }
        Commands::Embed { action } => {
            let app = App::build(cfg).await?;
            match action {
                EmbedAction::Pending { limit } => commands::run_embed_pending(&app, limit).await?,
                EmbedAction::Rebuild => commands::run_embed_rebuild(&app).await?,
            }
        }
        Commands::Search { query, limit } => {
            let app = App::build(cfg).await?;
            commands::run_search(&app, &query, limit).await?;
        }
        Commands::Chat {
            message,
            session,
            page_url,
            stream,
        } => {
            let app = App::build(cfg).await?;
            commands::run_chat(&app, message, session, page_url, stream).await?;
        }
    }

    Ok(())
}
