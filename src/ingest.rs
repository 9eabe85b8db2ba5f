//! Knowledge-file ingestion pipeline.
//!
//! ```text
//! bytes ──▶ blob store ──▶ file record (processing)
//!                              │
//!            extract ──▶ normalize + chunk ──▶ persist chunks
//!                              │
//!            embed in batches (failures logged, never fatal)
//!                              │
//!                        file record (ready, chunk_count)
//! ```
//!
//! Extraction failure or empty extracted text leaves the file in `error`.
//! Embedding outcome never blocks the `ready` transition; chunks without
//! vectors are still reachable through keyword search.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::blob::{blob_name, BlobStore};
use crate::chunk::chunk_file;
use crate::config::Config;
use crate::embedding::embed_chunks;
use crate::error::IngestError;
use crate::extract::{extract_text, is_blocking, mime_for_path, MIME_UNKNOWN};
use crate::models::{FileStatus, KnowledgeFile};
use crate::provider::ChatProvider;
use crate::store::Store;

pub struct Ingestor {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    provider: Arc<dyn ChatProvider>,
}

/// Per-directory import totals.
#[derive(Debug, Default)]
pub struct ImportSummary {
    pub files_ok: u64,
    pub files_failed: u64,
    pub chunks: u64,
    pub failures: Vec<(PathBuf, String)>,
}

impl Ingestor {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        provider: Arc<dyn ChatProvider>,
    ) -> Self {
        Self {
            config,
            store,
            blobs,
            provider,
        }
    }

    /// Store `bytes` and run the full pipeline.
    pub async fn ingest(
        &self,
        bytes: &[u8],
        mime_type: &str,
        original_name: &str,
    ) -> Result<KnowledgeFile, IngestError> {
        let max = self.config.storage.max_file_bytes;
        if bytes.len() as u64 > max {
            return Err(IngestError::TooLarge {
                size: bytes.len() as u64,
                max,
            });
        }

        let key = blob_name(original_name);
        self.blobs.put(&key, bytes).await?;
        let file = KnowledgeFile::new(&key, original_name, mime_type, bytes.len() as i64);
        if let Err(e) = self.store.insert_file(&file).await {
            if let Err(cleanup) = self.blobs.delete(&key).await {
                warn!("failed to remove orphaned blob {key}: {cleanup:#}");
            }
            return Err(e.into());
        }
        info!(file_id = %file.id, name = original_name, mime_type, "ingesting knowledge file");

        self.process(file, bytes.to_vec()).await
    }

    /// Drop a file's chunks and rerun the pipeline on its stored bytes.
    pub async fn reprocess(&self, file_id: &str) -> Result<KnowledgeFile, IngestError> {
        let mut file = self.find(file_id).await?;
        let bytes = self.blobs.get(&file.filename).await?;

        self.store
            .set_file_status(&file.id, FileStatus::Processing, 0)
            .await?;
        self.store.delete_chunks(&file.id).await?;
        file.status = FileStatus::Processing;
        file.chunk_count = 0;
        info!(file_id = %file.id, "reprocessing knowledge file");

        self.process(file, bytes).await
    }

    /// Remove a file's blob and record, cascading to chunks and embeddings.
    pub async fn delete(&self, file_id: &str) -> Result<(), IngestError> {
        let file = self.find(file_id).await?;
        if let Err(e) = self.blobs.delete(&file.filename).await {
            warn!(file_id, "failed to delete blob {}: {e:#}", file.filename);
        }
        self.store.delete_file(&file.id).await?;
        info!(file_id, name = %file.original_name, "deleted knowledge file");
        Ok(())
    }

    /// Ingest every file under `dir` with a recognized extension, continuing
    /// past failures. Dotfiles are skipped.
    pub async fn import_dir(&self, dir: &Path) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        let entries = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file());

        for entry in entries {
            let path = entry.path();
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unnamed")
                .to_string();
            let mime_type = mime_for_path(path);
            if name.starts_with('.') || mime_type == MIME_UNKNOWN {
                debug!(path = %path.display(), "skipping unrecognized file");
                continue;
            }

            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match self.ingest(&bytes, mime_type, &name).await {
                Ok(file) => {
                    summary.files_ok += 1;
                    summary.chunks += file.chunk_count as u64;
                }
                Err(e) => {
                    warn!(path = %path.display(), "import failed: {e}");
                    summary.files_failed += 1;
                    summary.failures.push((path.to_path_buf(), e.to_string()));
                }
            }
        }
        Ok(summary)
    }

    async fn find(&self, file_id: &str) -> Result<KnowledgeFile, IngestError> {
        self.store
            .get_file(file_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(file_id.to_string()))
    }

    async fn fail(&self, file: &KnowledgeFile) {
        if let Err(e) = self
            .store
            .set_file_status(&file.id, FileStatus::Error, 0)
            .await
        {
            warn!(file_id = %file.id, "failed to mark file as error: {e:#}");
        }
    }

    async fn extract(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String, IngestError> {
        if is_blocking(mime_type) {
            let mime = mime_type.to_string();
            tokio::task::spawn_blocking(move || extract_text(&bytes, &mime))
                .await
                .context("extraction task panicked")?
                .map_err(IngestError::from)
        } else {
            Ok(extract_text(&bytes, mime_type)?)
        }
    }

    async fn process(
        &self,
        mut file: KnowledgeFile,
        bytes: Vec<u8>,
    ) -> Result<KnowledgeFile, IngestError> {
        let text = match self.extract(bytes, &file.mime_type).await {
            Ok(t) => t,
            Err(e) => {
                warn!(file_id = %file.id, "extraction failed: {e}");
                self.fail(&file).await;
                return Err(e);
            }
        };

        let chunks = chunk_file(&file.id, &file.original_name, &text, &self.config.chunking);
        if chunks.is_empty() {
            warn!(file_id = %file.id, "no text extracted");
            self.fail(&file).await;
            return Err(IngestError::Empty(file.original_name));
        }

        if let Err(e) = self.store.insert_chunks(&chunks).await {
            self.fail(&file).await;
            return Err(e.into());
        }

        let stats = embed_chunks(
            self.provider.as_ref(),
            self.store.as_ref(),
            &chunks,
            &self.config.embedding,
        )
        .await;
        if stats.failed > 0 {
            warn!(
                file_id = %file.id,
                failed = stats.failed,
                "some chunks were not embedded; keyword search covers them"
            );
        }

        if let Err(e) = self
            .store
            .set_file_status(&file.id, FileStatus::Ready, chunks.len() as i64)
            .await
        {
            warn!(file_id = %file.id, "failed to mark file ready: {e:#}");
            self.fail(&file).await;
            return Err(e.into());
        }
        file.status = FileStatus::Ready;
        file.chunk_count = chunks.len() as i64;
        info!(
            file_id = %file.id,
            chunks = chunks.len(),
            embedded = stats.embedded,
            "knowledge file ready"
        );
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::store::InMemoryStore;
    use crate::testing::{test_config, FlakyStore, StubProvider};

    struct Fixture {
        ingestor: Ingestor,
        store: Arc<InMemoryStore>,
        blobs: Arc<MemoryBlobStore>,
    }

    fn small_chunks() -> Config {
        let mut config = test_config();
        config.chunking.chunk_tokens = 20;
        config.storage.max_file_bytes = 4096;
        config.embedding.max_retries = 0;
        config
    }

    fn flaky(store: FlakyStore) -> (Ingestor, Arc<FlakyStore>, Arc<MemoryBlobStore>) {
        let store = Arc::new(store);
        let blobs = Arc::new(MemoryBlobStore::new());
        let ingestor = Ingestor::new(
            Arc::new(small_chunks()),
            store.clone(),
            blobs.clone(),
            Arc::new(StubProvider::default()),
        );
        (ingestor, store, blobs)
    }

    fn fixture(provider: StubProvider) -> Fixture {
        let config = small_chunks();
        let store = Arc::new(InMemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        Fixture {
            ingestor: Ingestor::new(
                Arc::new(config),
                store.clone(),
                blobs.clone(),
                Arc::new(provider),
            ),
            store,
            blobs,
        }
    }

    fn sample() -> String {
        (0..6)
            .map(|i| format!("Paragraph {} explains warranty terms for model {}.", i, i))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[tokio::test]
    async fn test_ingest_reaches_ready_with_embeddings() {
        let f = fixture(StubProvider::default());
        let file = f
            .ingestor
            .ingest(sample().as_bytes(), "text/plain", "warranty.txt")
            .await
            .unwrap();

        assert_eq!(file.status, FileStatus::Ready);
        assert!(file.chunk_count > 1);
        assert!(f.blobs.contains(&file.filename));
        let stored = f.store.get_file(&file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Ready);
        assert_eq!(stored.chunk_count, file.chunk_count);
        assert_eq!(
            f.store.count_unembedded_ready_chunks("stub-embed").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_embedding_failure_still_ready() {
        let f = fixture(StubProvider::default().failing_embeddings(u32::MAX, 500));
        let file = f
            .ingestor
            .ingest(sample().as_bytes(), "text/plain", "warranty.txt")
            .await
            .unwrap();
        assert_eq!(file.status, FileStatus::Ready);
        assert_eq!(
            f.store
                .count_unembedded_ready_chunks("stub-embed")
                .await
                .unwrap(),
            file.chunk_count
        );
    }

    #[tokio::test]
    async fn test_empty_text_marks_error() {
        let f = fixture(StubProvider::default());
        let err = f
            .ingestor
            .ingest(b"  \n\n \r\n ", "text/plain", "blank.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Empty(_)));
        let files = f.store.list_files(None).await.unwrap();
        assert_eq!(files[0].status, FileStatus::Error);
    }

    #[tokio::test]
    async fn test_bad_pdf_marks_error() {
        let f = fixture(StubProvider::default());
        let err = f
            .ingestor
            .ingest(b"%PDF-garbage", "application/pdf", "broken.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Extraction(_)));
        let files = f.store.list_files(Some(FileStatus::Error)).await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_too_large_rejected_before_storage() {
        let f = fixture(StubProvider::default());
        let big = vec![b'a'; 5000];
        let err = f
            .ingestor
            .ingest(&big, "text/plain", "big.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::TooLarge { size: 5000, .. }));
        assert!(f.store.list_files(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reprocess_replaces_chunks() {
        let f = fixture(StubProvider::default());
        let file = f
            .ingestor
            .ingest(sample().as_bytes(), "text/plain", "warranty.txt")
            .await
            .unwrap();
        let before: Vec<String> = f
            .store
            .list_chunks(&file.id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();

        let again = f.ingestor.reprocess(&file.id).await.unwrap();
        assert_eq!(again.chunk_count, file.chunk_count);
        let after = f.store.list_chunks(&file.id).await.unwrap();
        assert_eq!(after.len() as i64, file.chunk_count);
        assert!(after.iter().all(|c| !before.contains(&c.id)));
    }

    #[tokio::test]
    async fn test_delete_removes_blob_and_record() {
        let f = fixture(StubProvider::default());
        let file = f
            .ingestor
            .ingest(sample().as_bytes(), "text/plain", "warranty.txt")
            .await
            .unwrap();
        f.ingestor.delete(&file.id).await.unwrap();

        assert!(!f.blobs.contains(&file.filename));
        assert!(f.store.get_file(&file.id).await.unwrap().is_none());
        assert!(f.store.list_chunks(&file.id).await.unwrap().is_empty());
        assert!(matches!(
            f.ingestor.delete(&file.id).await,
            Err(IngestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_import_dir_counts_failures() {
        let f = fixture(StubProvider::default());
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("faq.md"), sample()).unwrap();
        std::fs::create_dir(tmp.path().join("nested")).unwrap();
        std::fs::write(tmp.path().join("nested/hours.txt"), "Open nine to five.").unwrap();
        std::fs::write(tmp.path().join("empty.txt"), "   ").unwrap();
        std::fs::write(tmp.path().join(".hidden"), "skip me").unwrap();
        std::fs::write(tmp.path().join("logo.png"), [0x89, b'P', b'N', b'G']).unwrap();

        let summary = f.ingestor.import_dir(tmp.path()).await.unwrap();
        assert_eq!(summary.files_ok, 2);
        assert_eq!(summary.files_failed, 1);
        assert_eq!(summary.failures[0].0.file_name().unwrap(), "empty.txt");
    }

    #[tokio::test]
    async fn test_record_failure_removes_blob() {
        let (ingestor, store, blobs) = flaky(FlakyStore::default().failing_insert_file());
        let err = ingestor
            .ingest(sample().as_bytes(), "text/plain", "warranty.txt")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("disk full"));
        assert!(blobs.is_empty());
        assert!(store.list_files(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ready_transition_failure_marks_error() {
        let (ingestor, store, blobs) = flaky(FlakyStore::default().failing_ready_status());
        let err = ingestor
            .ingest(sample().as_bytes(), "text/plain", "warranty.txt")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("database is locked"));

        let files = store.list_files(None).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, FileStatus::Error);
        assert!(blobs.contains(&files[0].filename));
    }
}
