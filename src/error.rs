//! Error types for chariot
//!
//! This module defines the error hierarchy for the entire pipeline.
//! All public APIs return `Result<T, Error>` where Error is defined here.
//! Every error maps onto one [`ErrorKind`], which is what the orchestrator
//! and the retry policy reason about.

use std::fmt;
use thiserror::Error;

/// Closed classification of pipeline failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Source query errors and connection loss while exporting
    Source,
    /// Local disk, permission, partition and compression failures
    LocalIo,
    /// Object-storage transfer failures
    Transfer,
    /// Warehouse copy/merge failures
    Load,
    /// Invalid configuration, templates or identifiers
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Source => "source",
            ErrorKind::LocalIo => "local_io",
            ErrorKind::Transfer => "transfer",
            ErrorKind::Load => "load",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// The main error type for chariot
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid config value for '{field}': {message}")]
    InvalidConfigValue { field: String, message: String },

    #[error("Failed to parse pipeline YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // ============================================================================
    // Template Errors
    // ============================================================================
    #[error("Undefined variable in template: {variable}")]
    UndefinedVariable { variable: String },

    // ============================================================================
    // Source Database Errors
    // ============================================================================
    #[error("Source query failed: {message}")]
    Source { message: String },

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    // ============================================================================
    // Local Artifact Errors
    // ============================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Partition error for '{path}': {message}")]
    Partition { path: String, message: String },

    #[error("Compression error for '{path}': {message}")]
    Compress { path: String, message: String },

    // ============================================================================
    // Object Storage Errors
    // ============================================================================
    #[error("Storage error: {message}")]
    Storage { message: String, retryable: bool },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Max attempts ({attempts}) exceeded: {last}")]
    MaxRetriesExceeded { attempts: u32, last: Box<Error> },

    #[error("Upload failed for {} file(s): {}", .failures.len(), .failures.join("; "))]
    UploadFailed { failures: Vec<String> },

    // ============================================================================
    // Warehouse Errors
    // ============================================================================
    #[error("Warehouse error: {message}")]
    Warehouse { message: String },

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("Load of '{table}' rejected {rejected} row(s), tolerance is {max_errors}")]
    LoadRejected {
        table: String,
        rejected: u64,
        max_errors: u64,
    },

    // ============================================================================
    // Pipeline Errors
    // ============================================================================
    #[error("Table '{table}' failed at {stage}: {source}")]
    Stage {
        table: String,
        stage: String,
        #[source]
        source: Box<Error>,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfigValue {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an undefined variable error
    pub fn undefined_var(variable: impl Into<String>) -> Self {
        Self::UndefinedVariable {
            variable: variable.into(),
        }
    }

    /// Create a source query error
    pub fn source_query(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    /// Create a partition error
    pub fn partition(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Partition {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a compression error
    pub fn compress(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compress {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a transient storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a storage error that must not be retried (credentials, validation)
    pub fn storage_fatal(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a warehouse error
    pub fn warehouse(message: impl Into<String>) -> Self {
        Self::Warehouse {
            message: message.into(),
        }
    }

    /// Wrap an error with the table and stage it happened in
    pub fn at_stage(self, table: impl Into<String>, stage: impl fmt::Display) -> Self {
        Self::Stage {
            table: table.into(),
            stage: stage.to_string(),
            source: Box::new(self),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config { .. }
            | Error::InvalidConfigValue { .. }
            | Error::YamlParse(_)
            | Error::UndefinedVariable { .. } => ErrorKind::Config,
            Error::Source { .. } | Error::Postgres(_) => ErrorKind::Source,
            Error::Io(_)
            | Error::FileNotFound { .. }
            | Error::Partition { .. }
            | Error::Compress { .. }
            | Error::Other(_) => ErrorKind::LocalIo,
            Error::Storage { .. }
            | Error::Timeout { .. }
            | Error::MaxRetriesExceeded { .. }
            | Error::UploadFailed { .. } => ErrorKind::Transfer,
            Error::Warehouse { .. } | Error::DuckDb(_) | Error::LoadRejected { .. } => {
                ErrorKind::Load
            }
            Error::Stage { source, .. } => source.kind(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage { retryable, .. } => *retryable,
            Error::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias for chariot
pub type Result<T> = std::result::Result<T, Error>;
