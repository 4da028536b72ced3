//! Blob storage abstraction over interchangeable S3-API back-ends.
//!
//! The backend is a boot-time choice; everything downstream holds an
//! `Arc<dyn BlobStore>` and never learns which implementation it got.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};

mod s3;

pub use s3::{MinioBlobStore, S3BlobStore};

/// Errors emitted by blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("storage auth error: {0}")]
    Auth(String),

    #[error("storage io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        BlobError::Io(e.to_string())
    }
}

/// Opaque byte storage keyed by string.
///
/// `put` is atomic from the caller's perspective: on error the key is either
/// absent or fully written. `get` returns the bytes exactly as written.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, returning the key. Last writer wins.
    async fn put(&self, data: Bytes, key: &str) -> Result<String, BlobError>;

    /// Fetch the bytes stored under `key`.
    async fn get(&self, key: &str) -> Result<Bytes, BlobError>;

    /// Remove `key` if present.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// Best-effort retention sweep: delete every object whose last-modified
    /// time is strictly before `threshold`. Per-object failures are logged and
    /// iteration continues; the call succeeds once every enumerable object has
    /// been considered. Returns the number of objects deleted.
    async fn cleanup_before(&self, threshold: DateTime<Utc>) -> Result<u64, BlobError>;
}

/// Build the configured backend.
pub async fn connect(cfg: &StorageConfig) -> Result<Box<dyn BlobStore>, BlobError> {
    match cfg.backend {
        StorageBackend::S3 => Ok(Box::new(S3BlobStore::connect(&cfg.s3).await?)),
        StorageBackend::Minio => Ok(Box::new(MinioBlobStore::connect(&cfg.s3).await?)),
    }
}
