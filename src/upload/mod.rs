//! Uploader
//!
//! Moves compressed chunks into the chain bucket.
//!
//! # Overview
//!
//! - An object that already exists is never overwritten; the upload is
//!   skipped and reported with the same URI
//! - Transient storage failures are retried through a [`RetryPolicy`]
//! - Files above the multipart ceiling go up in fixed-size parts; a failed
//!   part aborts the whole upload so no partial object is finalized
//! - A directory is uploaded by a bounded pool of concurrent tasks and every
//!   task's outcome is gathered before failures are reported

mod retry;

pub use retry::RetryPolicy;

use crate::config::UploadSettings;
use crate::error::{Error, Result};
use crate::storage::{MultipartUpload, ObjectStorage};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

/// Files above this size are uploaded in parts (5 GB)
pub const MULTIPART_THRESHOLD: u64 = 5_000_000_000;

/// Multipart part size (500 MB)
pub const PART_SIZE: u64 = 500_000_000;

/// Transfer settings of an [`Uploader`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Concurrent uploads in [`Uploader::upload_directory`]
    pub workers: usize,
    /// Files above this size use multipart upload
    pub multipart_threshold: u64,
    /// Size of every part but the last
    pub part_size: u64,
    /// Deadline for a single try
    pub attempt_timeout: Option<Duration>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            multipart_threshold: MULTIPART_THRESHOLD,
            part_size: PART_SIZE,
            attempt_timeout: None,
        }
    }
}

impl UploadConfig {
    /// Build from the pipeline's upload settings
    pub fn from_settings(settings: &UploadSettings) -> Self {
        Self {
            workers: settings.workers.max(1),
            multipart_threshold: settings.multipart_threshold_bytes,
            part_size: settings.part_size_bytes,
            attempt_timeout: settings.attempt_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Result of uploading one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Object key inside the bucket
    pub key: String,
    /// URI of the object as the warehouse sees it
    pub uri: String,
    /// The object already existed and was left alone
    pub skipped: bool,
    /// Tries it took (0 when skipped)
    pub attempts: u32,
}

/// Result of uploading a directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// One outcome per file, ordered by key
    pub outcomes: Vec<UploadOutcome>,
}

impl UploadReport {
    /// Files transferred by this call
    pub fn uploaded(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.skipped).count()
    }

    /// Files that already existed
    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|o| o.skipped).count()
    }

    /// Every object URI, ordered by key
    pub fn uris(&self) -> Vec<String> {
        self.outcomes.iter().map(|o| o.uri.clone()).collect()
    }
}

/// Uploads local files into bucket-scoped object storage
pub struct Uploader {
    storage: Arc<dyn ObjectStorage>,
    retry: RetryPolicy,
    config: UploadConfig,
    region: String,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("retry", &self.retry)
            .field("config", &self.config)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// Create an uploader
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        retry: RetryPolicy,
        config: UploadConfig,
        region: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            retry,
            config,
            region: region.into(),
        }
    }

    /// Create an uploader from the pipeline's upload settings
    pub fn from_settings(
        storage: Arc<dyn ObjectStorage>,
        settings: &UploadSettings,
        region: impl Into<String>,
    ) -> Self {
        Self::new(
            storage,
            RetryPolicy::from_settings(settings),
            UploadConfig::from_settings(settings),
            region,
        )
    }

    /// The storage backend
    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    /// Get or create `bucket`, returning its URI
    #[instrument(skip(self))]
    pub async fn ensure_bucket(&self, bucket: &str) -> Result<String> {
        self.retry
            .run("Ensure bucket", || {
                self.storage.ensure_bucket(bucket, &self.region)
            })
            .await?;
        Ok(self.storage.uri(bucket, "").trim_end_matches('/').to_string())
    }

    /// Delete every object in `bucket`, returning how many were removed
    #[instrument(skip(self))]
    pub async fn purge_bucket(&self, bucket: &str) -> Result<usize> {
        let (keys, _) = self
            .retry
            .run("List bucket", || self.storage.list(bucket, ""))
            .await?;

        for key in &keys {
            self.retry
                .run("Delete object", || self.storage.delete(bucket, key))
                .await?;
        }

        if !keys.is_empty() {
            info!(bucket, objects = keys.len(), "Purged bucket");
        }
        Ok(keys.len())
    }

    /// Upload `local_path` to `key` unless the object already exists
    #[instrument(skip(self, local_path), fields(path = %local_path.display()))]
    pub async fn upload(&self, bucket: &str, key: &str, local_path: &Path) -> Result<UploadOutcome> {
        let uri = self.storage.uri(bucket, key);

        let (exists, _) = self
            .retry
            .run("Check object", || self.storage.exists(bucket, key))
            .await?;
        if exists {
            debug!(uri, "Object exists, skipping");
            return Ok(UploadOutcome {
                key: key.to_string(),
                uri,
                skipped: true,
                attempts: 0,
            });
        }

        let size = tokio::fs::metadata(local_path).await?.len();
        let ((), attempts) = if size > self.config.multipart_threshold {
            self.retry
                .run("Multipart upload", || {
                    self.put_multipart(bucket, key, local_path, size)
                })
                .await?
        } else {
            self.retry
                .run("Upload", || self.put_single(bucket, key, local_path))
                .await?
        };

        info!(uri, size, attempts, "Uploaded object");
        Ok(UploadOutcome {
            key: key.to_string(),
            uri,
            skipped: false,
            attempts,
        })
    }

    /// Upload every regular file of `dir` under `prefix`
    ///
    /// Runs up to `workers` uploads at once. Every file is attempted; if any
    /// fail, the error lists all of them.
    #[instrument(skip(self, dir), fields(dir = %dir.display()))]
    pub async fn upload_directory(&self, bucket: &str, prefix: &str, dir: &Path) -> Result<UploadReport> {
        let files = list_files(dir).await?;

        let results: Vec<(String, Result<UploadOutcome>)> = stream::iter(files)
            .map(|(name, path)| async move {
                let key = format!("{prefix}{name}");
                let result = self.upload(bucket, &key, &path).await;
                (name, result)
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(file = %name, error = %e, "Upload failed");
                    failures.push(format!("{name}: {e}"));
                }
            }
        }

        if !failures.is_empty() {
            failures.sort();
            return Err(Error::UploadFailed { failures });
        }

        outcomes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(UploadReport { outcomes })
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Error::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })?,
            None => fut.await,
        }
    }

    async fn put_single(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()> {
        let data = Bytes::from(tokio::fs::read(local_path).await?);
        self.with_deadline(self.storage.put(bucket, key, data)).await
    }

    async fn put_multipart(&self, bucket: &str, key: &str, local_path: &Path, size: u64) -> Result<()> {
        let mut upload = self.storage.start_multipart(bucket, key).await?;

        let sent = self
            .with_deadline(async {
                let parts = self.send_parts(upload.as_mut(), local_path, size).await?;
                upload.complete().await?;
                Ok(parts)
            })
            .await;

        match sent {
            Ok(parts) => {
                debug!(key, parts, "Completed multipart upload");
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = upload.abort().await {
                    warn!(key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn send_parts(
        &self,
        upload: &mut dyn MultipartUpload,
        local_path: &Path,
        size: u64,
    ) -> Result<u32> {
        let part_size = self.config.part_size.max(1);
        let mut file = tokio::fs::File::open(local_path).await?;
        let mut remaining = size;
        let mut part_number = 0u32;

        while remaining > 0 {
            let len = remaining.min(part_size);
            let mut buf = Vec::with_capacity(len as usize);
            (&mut file).take(len).read_to_end(&mut buf).await?;
            if buf.len() as u64 != len {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} changed size during upload", local_path.display()),
                )));
            }

            part_number += 1;
            upload.put_part(part_number, Bytes::from(buf)).await?;
            remaining -= len;
        }

        Ok(part_number)
    }
}

/// Regular files of `dir` with their names, sorted by name
async fn list_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.push((name.to_string(), entry.path()));
        }
    }

    files.sort();
    Ok(files)
}
