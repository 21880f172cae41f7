//! Blob storage for raw and parsed payloads.
//!
//! Keys are opaque strings chosen by the caller; `blob_key` derives the
//! deterministic `yyyy/mm/dd/{url_hash}.html` layout so at-least-once writes
//! stay idempotent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use tracing::debug;

use crawlgrid_core::StoreError;

/// Deterministic key for a payload fetched at `fetched_at`.
pub fn blob_key(url_hash: &str, fetched_at: DateTime<Utc>) -> String {
    format!(
        "{:04}/{:02}/{:02}/{}.html",
        fetched_at.year(),
        fetched_at.month(),
        fetched_at.day(),
        url_hash
    )
}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn head(&self, key: &str) -> Result<bool, StoreError>;
}

/// In-process blob store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<(), StoreError> {
        self.blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .get(key)
            .map(|b| b.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn head(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.contains_key(key))
    }
}

/// Filesystem blob store. One root per logical bucket (raw, parsed); the
/// slash-separated key maps onto a directory tree under the root.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        // keys are caller-derived, but refuse traversal outright
        if key.split('/').any(|part| part == "..") || key.starts_with('/') {
            return Err(StoreError::Unavailable(format!("invalid blob key: {key}")));
        }
        Ok(self.root.join(Path::new(key)))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        debug!(key, content_type, bytes = bytes.len(), "blob stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::Unavailable(e.to_string())),
        }
    }

    async fn head(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?)
    }
}
