//! Blob store adapter: opaque bytes keyed by path.
//!
//! The engine only downloads originals for parsing and uploads derived
//! display PDFs, so the contract is exactly those two calls.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;

use crate::error::{EngineError, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn download(&self, path: &str) -> Result<Vec<u8>>;
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<()>;
}

/// Filesystem-rooted blob store for local deployments.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        // Blob keys are opaque but must stay under the root.
        if path.contains("..") {
            return Err(EngineError::Validation(format!("invalid blob path: {path}")));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to download blob {path}: {e}")))
    }

    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::Storage(format!("failed to create blob dir: {e}")))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to upload blob {path}: {e}")))
    }
}

/// In-memory blob store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.blobs
            .get(path)
            .map(|b| b.clone())
            .ok_or_else(|| EngineError::Storage(format!("blob not found: {path}")))
    }

    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store.upload("uploads/a.md", b"# hello").await.unwrap();
        assert_eq!(store.download("uploads/a.md").await.unwrap(), b"# hello");
    }

    #[tokio::test]
    async fn test_local_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(store.download("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_missing_blob() {
        let store = MemoryBlobStore::new();
        assert!(matches!(
            store.download("nope").await.unwrap_err(),
            EngineError::Storage(_)
        ));
    }
}
