//! Local filesystem and in-memory storage over `object_store`
//!
//! Each bucket is its own store: a sub-directory of the root for the
//! filesystem backend, a fresh `InMemory` for the memory backend. Local
//! object URIs are absolute `file://` paths so a local warehouse can read the
//! objects straight from disk.

use super::{MultipartUpload, ObjectStorage};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Convert an `object_store` error
fn store_error(operation: &str, err: object_store::Error) -> Error {
    let message = format!("{operation} failed: {err}");
    match err {
        object_store::Error::NotFound { .. }
        | object_store::Error::InvalidPath { .. }
        | object_store::Error::NotSupported { .. } => Error::storage_fatal(message),
        _ => Error::storage(message),
    }
}

#[derive(Debug)]
enum Backend {
    Filesystem { root: PathBuf },
    Memory,
}

/// Object storage on the local machine
#[derive(Debug)]
pub struct LocalStorage {
    backend: Backend,
    buckets: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl LocalStorage {
    /// Store buckets as sub-directories of `root`
    pub fn filesystem(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| {
            Error::config(format!(
                "Failed to create storage root {}: {e}",
                root.display()
            ))
        })?;
        let root = root.canonicalize()?;

        Ok(Self {
            backend: Backend::Filesystem { root },
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Keep buckets in process memory
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory of the filesystem backend
    pub fn root(&self) -> Option<&Path> {
        match &self.backend {
            Backend::Filesystem { root } => Some(root),
            Backend::Memory => None,
        }
    }

    fn cached(&self, bucket: &str) -> Option<Arc<dyn ObjectStore>> {
        self.buckets
            .lock()
            .ok()
            .and_then(|buckets| buckets.get(bucket).cloned())
    }

    fn remember(&self, bucket: &str, store: Arc<dyn ObjectStore>) -> Arc<dyn ObjectStore> {
        if let Ok(mut buckets) = self.buckets.lock() {
            return buckets
                .entry(bucket.to_string())
                .or_insert(store)
                .clone();
        }
        store
    }

    fn open_dir(dir: &Path) -> Result<Arc<dyn ObjectStore>> {
        let store = LocalFileSystem::new_with_prefix(dir)
            .map_err(|e| store_error("Open bucket directory", e))?;
        Ok(Arc::new(store))
    }

    /// Store for an existing bucket
    fn bucket(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        if let Some(store) = self.cached(bucket) {
            return Ok(store);
        }

        match &self.backend {
            Backend::Filesystem { root } => {
                let dir = root.join(bucket);
                if !dir.is_dir() {
                    return Err(Error::storage_fatal(format!(
                        "Bucket '{bucket}' does not exist"
                    )));
                }
                Ok(self.remember(bucket, Self::open_dir(&dir)?))
            }
            Backend::Memory => Err(Error::storage_fatal(format!(
                "Bucket '{bucket}' does not exist"
            ))),
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn ensure_bucket(&self, bucket: &str, _region: &str) -> Result<()> {
        if self.cached(bucket).is_some() {
            return Ok(());
        }

        let store: Arc<dyn ObjectStore> = match &self.backend {
            Backend::Filesystem { root } => {
                let dir = root.join(bucket);
                tokio::fs::create_dir_all(&dir).await?;
                Self::open_dir(&dir)?
            }
            Backend::Memory => Arc::new(InMemory::new()),
        };
        self.remember(bucket, store);
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let store = self.bucket(bucket)?;
        let prefix = prefix.trim_end_matches('/');
        let prefix = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));

        let objects: Vec<_> = store
            .list(prefix.as_ref())
            .try_collect()
            .await
            .map_err(|e| store_error("List", e))?;

        let mut keys: Vec<String> = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let store = self.bucket(bucket)?;
        match store.head(&ObjectPath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(store_error("Head", e)),
        }
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        let store = self.bucket(bucket)?;
        store
            .put(&ObjectPath::from(key), data.into())
            .await
            .map_err(|e| store_error("Put", e))?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let store = self.bucket(bucket)?;
        store
            .delete(&ObjectPath::from(key))
            .await
            .map_err(|e| store_error("Delete", e))
    }

    async fn start_multipart(&self, bucket: &str, key: &str) -> Result<Box<dyn MultipartUpload>> {
        let store = self.bucket(bucket)?;
        let inner = store
            .put_multipart(&ObjectPath::from(key))
            .await
            .map_err(|e| store_error("Start multipart", e))?;
        Ok(Box::new(LocalMultipart { inner }))
    }

    fn uri(&self, bucket: &str, key: &str) -> String {
        match &self.backend {
            Backend::Filesystem { root } => {
                format!("file://{}", root.join(bucket).join(key).display())
            }
            Backend::Memory => format!("memory://{bucket}/{key}"),
        }
    }
}

/// Multipart upload through `object_store`
///
/// `object_store` orders parts by call order, which matches the uploader's
/// ascending part numbers.
struct LocalMultipart {
    inner: Box<dyn object_store::MultipartUpload>,
}

#[async_trait]
impl MultipartUpload for LocalMultipart {
    async fn put_part(&mut self, _part_number: u32, data: Bytes) -> Result<()> {
        self.inner
            .put_part(data.into())
            .await
            .map_err(|e| store_error("Put part", e))
    }

    async fn complete(&mut self) -> Result<()> {
        self.inner
            .complete()
            .await
            .map_err(|e| store_error("Complete multipart", e))?;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.inner
            .abort()
            .await
            .map_err(|e| store_error("Abort multipart", e))
    }
}
