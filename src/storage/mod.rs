//! Object storage adapters
//!
//! The uploader and the orchestrator only see [`ObjectStorage`]:
//! - S3 and S3-compatible endpoints through `aws-sdk-s3` ([`S3Storage`])
//! - a local directory or process memory through `object_store`
//!   ([`LocalStorage`]), one sub-directory or store per bucket
//!
//! Errors are classified on the way out: transient failures become retryable
//! [`Error::Storage`], credential and validation failures fatal ones.
//!
//! [`Error::Storage`]: crate::Error::Storage

mod local;
mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

use crate::config::StorageConfig;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Bucket-scoped object storage
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Create the bucket in `region` unless it already exists
    async fn ensure_bucket(&self, bucket: &str, region: &str) -> Result<()>;

    /// Keys under `prefix`, sorted
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Whether `key` exists
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Store `data` under `key` in one request
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<()>;

    /// Remove `key`
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Begin a multipart upload of `key`
    async fn start_multipart(&self, bucket: &str, key: &str) -> Result<Box<dyn MultipartUpload>>;

    /// URI of `key` as the warehouse sees it
    fn uri(&self, bucket: &str, key: &str) -> String;
}

/// An open multipart upload
///
/// Nothing is visible under the key until [`complete`](Self::complete)
/// succeeds. Parts must be sent in ascending order starting at 1. An upload
/// whose completion fails is still open and must be aborted.
#[async_trait]
pub trait MultipartUpload: Send {
    /// Upload one part
    async fn put_part(&mut self, part_number: u32, data: Bytes) -> Result<()>;

    /// Finalize the object from every uploaded part
    async fn complete(&mut self) -> Result<()>;

    /// Discard every uploaded part
    async fn abort(&mut self) -> Result<()>;
}

/// Build the configured storage backend
pub async fn connect_storage(config: &StorageConfig) -> Result<Arc<dyn ObjectStorage>> {
    match config {
        StorageConfig::S3 {
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            path_style,
        } => {
            let storage = S3Storage::connect(
                region,
                endpoint.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *path_style,
            )
            .await?;
            Ok(Arc::new(storage))
        }
        StorageConfig::Local { root } => Ok(Arc::new(LocalStorage::filesystem(root)?)),
        StorageConfig::Memory => Ok(Arc::new(LocalStorage::in_memory())),
    }
}
