//! Common types used throughout chariot
//!
//! This module contains shared type definitions used across multiple modules.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Chain
// ============================================================================

/// Identifier of one pipeline run
///
/// Namespaces the working directories, the bucket and the staging tables, so
/// it is restricted to characters that are safe in all three.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainId(String);

impl ChainId {
    /// Validate and wrap a chain identifier
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::invalid_value("chain_id", "cannot be empty"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::invalid_value(
                "chain_id",
                format!("'{id}' may only contain ASCII letters, digits, '-' and '_'"),
            ));
        }
        Ok(Self(id))
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ChainId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ChainId> for String {
    fn from(id: ChainId) -> Self {
        id.0
    }
}

// ============================================================================
// Artifact
// ============================================================================

/// Stage of a file on local storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStage {
    /// Whole export of a table
    Raw,
    /// Size-bounded slice of an export
    Chunk,
    /// Gzip-compressed chunk
    Compressed,
}

/// A file produced by one of the local stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Table the file belongs to
    pub table: String,
    /// Which stage produced it
    pub stage: ArtifactStage,
    /// Location on disk
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
}

impl Artifact {
    /// Describe an existing file, reading its size from disk
    pub fn from_path(
        table: impl Into<String>,
        stage: ArtifactStage,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::FileNotFound {
                        path: path.display().to_string(),
                    }
                } else {
                    Error::Io(e)
                }
            })?
            .len();
        Ok(Self {
            table: table.into(),
            stage,
            path,
            size,
        })
    }

    /// File name without the directory
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }
}

// ============================================================================
// Query Kind
// ============================================================================

/// How a job's merge statement reconciles staging into the target
///
/// The loader never builds merge SQL itself; the kind is carried for
/// reporting and for merge templates that branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Delete matching rows then insert (or native MERGE)
    #[default]
    Upsert,
    /// Replace every row of the chain
    Replace,
    /// Insert only
    Append,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::Upsert => write!(f, "upsert"),
            QueryKind::Replace => write!(f, "replace"),
            QueryKind::Append => write!(f, "append"),
        }
    }
}

// ============================================================================
// Run Mode
// ============================================================================

/// How the orchestrator walks the job list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum RunMode {
    /// Process every job, collecting failures
    #[default]
    All,
    /// Stop the chain at the first failed table
    FailFast,
    /// Process only the first job
    FirstTable,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::All => write!(f, "all"),
            RunMode::FailFast => write!(f, "fail_fast"),
            RunMode::FirstTable => write!(f, "first_table"),
        }
    }
}

// ============================================================================
// Backoff Type
// ============================================================================

/// Type of backoff for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// Constant delay between retries
    Constant,
    /// Linear increase in delay
    Linear,
    /// Exponential increase in delay
    #[default]
    Exponential,
}

// ============================================================================
// Log Level
// ============================================================================

/// Log level for the pipeline log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

// ============================================================================
// Utilities
// ============================================================================

/// Extension trait for Option<String> to handle empty strings
pub trait OptionStringExt {
    /// Returns None if the string is empty
    fn none_if_empty(self) -> Option<String>;
}

impl OptionStringExt for Option<String> {
    fn none_if_empty(self) -> Option<String> {
        self.filter(|s| !s.is_empty())
    }
}

/// Quote a string literal for SQL, doubling embedded single quotes
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Check that a name is usable as a bare SQL identifier (optionally schema-qualified)
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_validation() {
        assert_eq!(ChainId::new("42").unwrap().as_str(), "42");
        assert_eq!(ChainId::new("eu-run_7").unwrap().to_string(), "eu-run_7");

        assert!(ChainId::new("").is_err());
        assert!(ChainId::new("a b").is_err());
        assert!(ChainId::new("x;DROP").is_err());
        assert!(ChainId::new("../etc").is_err());
    }

    #[test]
    fn test_chain_id_serde() {
        let id: ChainId = serde_json::from_str("\"17\"").unwrap();
        assert_eq!(id.as_str(), "17");
        assert!(serde_json::from_str::<ChainId>("\"no spaces\"").is_err());
    }

    #[test]
    fn test_artifact_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.csv");
        std::fs::write(&path, b"\"1\"|\"a\"\n").unwrap();

        let artifact = Artifact::from_path("orders", ArtifactStage::Raw, &path).unwrap();
        assert_eq!(artifact.size, 8);
        assert_eq!(artifact.file_name(), "orders.csv");

        let missing = Artifact::from_path("orders", ArtifactStage::Raw, dir.path().join("x.csv"));
        assert!(matches!(missing, Err(Error::FileNotFound { .. })));
    }

    #[test]
    fn test_query_kind_serde() {
        let kind: QueryKind = serde_json::from_str("\"replace\"").unwrap();
        assert_eq!(kind, QueryKind::Replace);
        assert_eq!(QueryKind::default(), QueryKind::Upsert);
    }

    #[test]
    fn test_run_mode_serde() {
        let mode: RunMode = serde_json::from_str("\"fail_fast\"").unwrap();
        assert_eq!(mode, RunMode::FailFast);
        assert_eq!(RunMode::FirstTable.to_string(), "first_table");
    }

    #[test]
    fn test_sql_literal() {
        assert_eq!(sql_literal("plain"), "'plain'");
        assert_eq!(sql_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("orders"));
        assert!(is_identifier("public.orders_2024"));
        assert!(is_identifier("_tmp"));

        assert!(!is_identifier(""));
        assert!(!is_identifier("1orders"));
        assert!(!is_identifier("orders;"));
        assert!(!is_identifier("public."));
    }

    #[test]
    fn test_option_string_none_if_empty() {
        assert_eq!(
            Some("test".to_string()).none_if_empty(),
            Some("test".to_string())
        );
        assert_eq!(Some(String::new()).none_if_empty(), None);
        assert_eq!(None::<String>.none_if_empty(), None);
    }
}
