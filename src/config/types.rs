//! Pipeline configuration types
//!
//! Declarative pipeline definition types for YAML parsing.

use crate::error::{Error, Result};
use crate::template::{self, TemplateContext};
use crate::types::{BackoffType, ChainId, LogLevel, QueryKind, RunMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Bounds on a rendered bucket name
const MIN_BUCKET_LEN: usize = 3;
const MAX_BUCKET_LEN: usize = 63;

// ============================================================================
// Pipeline Definition
// ============================================================================

/// Top-level pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    /// Root of the per-chain working directories
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Bucket name template, rendered with `chain_id`
    #[serde(default = "default_bucket_template")]
    pub bucket_template: String,
    /// How the job list is walked
    #[serde(default)]
    pub mode: RunMode,
    /// Keep working directories after the run
    #[serde(default)]
    pub keep_artifacts: bool,
    /// Database the tables are exported from
    pub source: SourceConfig,
    /// Warehouse the tables are loaded into
    pub warehouse: WarehouseConfig,
    /// Object storage the chunks travel through
    pub storage: StorageConfig,
    /// Chunking policy
    #[serde(default)]
    pub partition: PartitionSettings,
    /// Upload policy
    #[serde(default)]
    pub upload: UploadSettings,
    /// Load policy
    #[serde(default)]
    pub load: LoadSettings,
    /// Deadlines for network-facing stages
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Log outputs
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Tables to move, in order
    pub jobs: Vec<ExportJob>,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_bucket_template() -> String {
    "chain-{{ chain_id }}".to_string()
}

impl PipelineConfig {
    /// Render the bucket name for a chain
    ///
    /// Lowercased with `_` mapped to `-`. The result must be 3 to 63
    /// characters of lowercase letters, digits, `-` and `.`.
    pub fn bucket_name(&self, chain_id: &ChainId) -> Result<String> {
        let mut ctx = TemplateContext::new();
        ctx.set("chain_id", chain_id.as_str());
        let name = template::render(&self.bucket_template, &ctx)?
            .to_ascii_lowercase()
            .replace('_', "-");

        if !(MIN_BUCKET_LEN..=MAX_BUCKET_LEN).contains(&name.len()) {
            return Err(Error::invalid_value(
                "bucket_template",
                format!(
                    "'{name}' must be {MIN_BUCKET_LEN} to {MAX_BUCKET_LEN} characters, got {}",
                    name.len()
                ),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        {
            return Err(Error::invalid_value(
                "bucket_template",
                format!("'{name}' is not a valid bucket name"),
            ));
        }
        Ok(name)
    }

    /// Look up a job by table name
    pub fn job(&self, table: &str) -> Option<&ExportJob> {
        self.jobs.iter().find(|j| j.table == table)
    }
}

// ============================================================================
// Export Job
// ============================================================================

/// One table moved by the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExportJob {
    /// Target table name in the warehouse (also names the artifacts)
    pub table: String,
    /// Merge strategy carried to the loader
    #[serde(default)]
    pub query_kind: QueryKind,
    /// Source query template
    pub export_query: String,
    /// Merge/upsert statement template run after the copy
    pub merge_query: String,
}

impl ExportJob {
    /// Staging table name for this job within a chain
    pub fn staging_table(&self, chain_id: &ChainId) -> String {
        crate::load::staging_table_name(&self.table, chain_id)
    }

    /// Object key prefix for this job's chunks
    pub fn object_prefix(&self) -> String {
        format!("{}/", self.table)
    }
}

// ============================================================================
// Source Definition
// ============================================================================

/// Source database connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// PostgreSQL, exported with `COPY ... TO STDOUT`
    Postgres {
        /// Connection string (template, e.g. `{{ env.SOURCE_DATABASE_URL }}`)
        url: String,
    },
    /// DuckDB database file
    Duckdb {
        /// Database path (`:memory:` allowed)
        path: String,
    },
}

// ============================================================================
// Warehouse Definition
// ============================================================================

/// Warehouse connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WarehouseConfig {
    /// Amazon Redshift over the PostgreSQL wire protocol
    Redshift {
        /// Connection string (template)
        url: String,
        /// Region of the bucket the COPY reads from
        region: String,
        /// Credentials the warehouse uses to read the bucket
        credentials: CopyCredentials,
    },
    /// DuckDB database file
    Duckdb {
        /// Database path
        path: String,
    },
}

/// Credentials passed to a warehouse-side COPY
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyCredentials {
    /// IAM role ARN attached to the cluster
    IamRole(String),
    /// Static key pair (templates allowed)
    AccessKeys {
        access_key_id: String,
        secret_access_key: String,
    },
}

// ============================================================================
// Storage Definition
// ============================================================================

/// Object storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Amazon S3 or an S3-compatible endpoint
    S3 {
        /// Region buckets are created in
        region: String,
        /// Custom endpoint (MinIO, R2, ...)
        #[serde(default)]
        endpoint: Option<String>,
        /// Static access key id (falls back to the default AWS chain)
        #[serde(default)]
        access_key_id: Option<String>,
        /// Static secret key
        #[serde(default)]
        secret_access_key: Option<String>,
        /// Path-style addressing
        #[serde(default)]
        path_style: bool,
    },
    /// Local directory, one sub-directory per bucket
    Local {
        /// Root directory
        root: PathBuf,
    },
    /// In-process memory store
    Memory,
}

impl StorageConfig {
    /// Region buckets are created in
    pub fn region(&self) -> &str {
        match self {
            StorageConfig::S3 { region, .. } => region,
            StorageConfig::Local { .. } | StorageConfig::Memory => "local",
        }
    }
}

// ============================================================================
// Stage Settings
// ============================================================================

/// Chunking policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PartitionSettings {
    /// Largest chunk in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> u64 {
    crate::partition::DEFAULT_CHUNK_SIZE
}

/// Upload policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UploadSettings {
    /// Concurrent uploads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Total tries per file
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff strategy between tries
    #[serde(default)]
    pub backoff: BackoffType,
    /// First backoff delay
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Files above this size use multipart upload
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    /// Multipart part size
    #[serde(default = "default_part_size")]
    pub part_size_bytes: u64,
    /// Deadline for a single try
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff: BackoffType::default(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
            attempt_timeout_secs: None,
        }
    }
}

fn default_workers() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multipart_threshold() -> u64 {
    crate::upload::MULTIPART_THRESHOLD
}

fn default_part_size() -> u64 {
    crate::upload::PART_SIZE
}

/// Load policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoadSettings {
    /// Rejected rows tolerated per load
    #[serde(default = "default_max_errors")]
    pub max_errors: u64,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            max_errors: default_max_errors(),
        }
    }
}

fn default_max_errors() -> u64 {
    100
}

/// Deadlines for network-facing stages (unset = none)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutSettings {
    #[serde(default)]
    pub export_secs: Option<u64>,
    #[serde(default)]
    pub load_secs: Option<u64>,
}

/// Log outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingSettings {
    /// Minimum level
    #[serde(default)]
    pub level: LogLevel,
    /// Persistent log file
    #[serde(default = "default_log_file")]
    pub file: Option<PathBuf>,
    /// Also log to stdout
    #[serde(default = "default_true")]
    pub console: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            file: default_log_file(),
            console: true,
        }
    }
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("/tmp/chariot.log"))
}

fn default_true() -> bool {
    true
}
