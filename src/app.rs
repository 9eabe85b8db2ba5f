//! Component wiring.
//!
//! [`App`] builds every service from one [`Config`] so the CLI, the HTTP
//! server, and integration tests share a single construction path.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::agent::Agent;
use crate::blob::{BlobStore, FsBlobStore};
use crate::chat::ChatService;
use crate::config::Config;
use crate::db;
use crate::ingest::Ingestor;
use crate::migrate;
use crate::provider::{create_provider_or_disabled, ChatProvider};
use crate::retrieval::Retriever;
use crate::store::{SqliteStore, Store};
use crate::tools::{HttpPageFetcher, PageFetcher, ToolContext, ToolRegistry};

#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn ChatProvider>,
    pub retriever: Arc<Retriever>,
    pub ingestor: Arc<Ingestor>,
    pub chat: ChatService,
}

impl App {
    /// SQLite store, filesystem blobs, the configured vendor, live page fetches.
    ///
    /// Applies the schema first, so a fresh database works without `init`.
    pub async fn build(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;

        let provider = create_provider_or_disabled(&config);
        info!(
            provider = provider.name(),
            embedding_model = provider.embedding_model(),
            db = %config.db.path.display(),
            "application ready"
        );

        let blobs = Arc::new(FsBlobStore::new(config.storage.blob_dir.clone()));
        Ok(Self::from_parts(
            Arc::new(config),
            Arc::new(SqliteStore::new(pool)),
            blobs,
            provider,
            Arc::new(HttpPageFetcher::default()),
        ))
    }

    pub fn from_parts(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        provider: Arc<dyn ChatProvider>,
        pages: Arc<dyn PageFetcher>,
    ) -> Self {
        let retriever = Arc::new(Retriever::new(store.clone(), provider.clone()));
        let ctx = Arc::new(ToolContext::new(
            config.clone(),
            store.clone(),
            retriever.clone(),
            pages,
        ));
        let tools = Arc::new(ToolRegistry::with_builtins(&config));
        let agent = Agent::new(config.clone(), provider.clone(), tools, ctx);
        let ingestor = Arc::new(Ingestor::new(
            config.clone(),
            store.clone(),
            blobs,
            provider.clone(),
        ));
        let chat = ChatService::new(config.clone(), store.clone(), agent);

        Self {
            config,
            store,
            provider,
            retriever,
            ingestor,
            chat,
        }
    }
}
