//! Storage for uploaded document bytes.
//!
//! Blobs are keyed by an opaque generated name (see [`blob_name`]); the
//! original filename only lives on the [`KnowledgeFile`](crate::models::KnowledgeFile)
//! record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<()>;
    async fn get(&self, name: &str) -> Result<Vec<u8>>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Generate a fresh blob key, keeping the original extension when it is
/// plain alphanumeric.
pub fn blob_name(original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
        None => Uuid::new_v4().to_string(),
    }
}

// ============ Filesystem ============

/// Blobs as flat files under one directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            bail!("invalid blob name: {}", name);
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(name)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create blob dir: {}", self.root.display()))?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write blob: {}", path.display()))
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob: {}", path.display()))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete blob: {}", path.display())),
        }
    }
}

// ============ In-memory ============

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.blobs
            .read()
            .map(|b| b.contains_key(name))
            .unwrap_or(false)
    }
    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .map_err(|_| anyhow!("blob store lock poisoned"))?
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .map_err(|_| anyhow!("blob store lock poisoned"))?
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("blob not found: {}", name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.blobs
            .write()
            .map_err(|_| anyhow!("blob store lock poisoned"))?
            .remove(name);
        Ok(())
    }
}
