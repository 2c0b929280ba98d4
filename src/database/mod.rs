//! Database adapters
//!
//! The pipeline talks to databases through two narrow seams:
//! - [`SourceDatabase`] streams a query result to a delimited file
//! - [`Warehouse`] runs the staging, copy and merge statements of a load
//!
//! PostgreSQL (source) and Redshift (warehouse) go over `tokio-postgres`.
//! DuckDB implements both sides for local runs and tests.

mod duckdb;
mod postgres;

pub use self::duckdb::DuckDbEngine;
pub use self::postgres::{PostgresSource, RedshiftWarehouse};

use crate::config::{SourceConfig, WarehouseConfig};
use crate::error::{Error, Result};
use crate::template::{self, TemplateContext};
use crate::types::is_identifier;
use async_trait::async_trait;
use std::path::Path;

/// Field delimiter of every exported artifact
pub const DELIMITER: char = '|';

/// Quote character of every exported artifact
pub const QUOTE: char = '"';

/// Result of streaming a query to disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportStats {
    /// Rows written, when the database reports it
    pub rows: Option<u64>,
    /// Bytes written
    pub bytes: u64,
}

/// Objects a bulk copy reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    /// URI of the key prefix holding the objects (`s3://bucket/table/`)
    pub prefix: String,
    /// URI of every object under the prefix
    pub objects: Vec<String>,
}

/// Tuning for a bulk copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOptions {
    /// Rejected rows tolerated before the copy fails
    pub max_errors: u64,
}

/// Database a table is exported from
#[async_trait]
pub trait SourceDatabase: Send {
    /// Run `query` and stream its result set to `dest` as delimited text
    ///
    /// Format: `|` delimiter, non-null fields quoted with `"`, embedded quotes
    /// doubled, NULL as an empty unquoted field, no header. A partially
    /// written file is removed on error.
    async fn export_delimited(&mut self, query: &str, dest: &Path) -> Result<ExportStats>;
}

/// Warehouse a table is loaded into
#[async_trait]
pub trait Warehouse: Send {
    /// Execute one or more statements
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Open a transaction
    async fn begin(&mut self) -> Result<()>;

    /// Commit the open transaction
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction
    async fn rollback(&mut self) -> Result<()>;

    /// Create `staging` with the columns of `target` unless it exists
    async fn create_table_like(&mut self, staging: &str, target: &str) -> Result<()>;

    /// Remove every row of `table`
    async fn truncate(&mut self, table: &str) -> Result<()>;

    /// Bulk copy gzip-compressed delimited objects into `table`
    ///
    /// Returns the number of rows copied.
    async fn copy_in(
        &mut self,
        table: &str,
        source: &CopySource,
        options: &CopyOptions,
    ) -> Result<u64>;
}

/// Connect to the configured source database
pub async fn connect_source(config: &SourceConfig) -> Result<Box<dyn SourceDatabase>> {
    let ctx = TemplateContext::new();
    match config {
        SourceConfig::Postgres { url } => {
            let url = template::render(url, &ctx)?;
            Ok(Box::new(PostgresSource::connect(&url).await?))
        }
        SourceConfig::Duckdb { path } => {
            let path = template::render(path, &ctx)?;
            Ok(Box::new(DuckDbEngine::open(&path)?))
        }
    }
}

/// Connect to the configured warehouse
pub async fn connect_warehouse(config: &WarehouseConfig) -> Result<Box<dyn Warehouse>> {
    let ctx = TemplateContext::new();
    match config {
        WarehouseConfig::Redshift {
            url,
            region,
            credentials,
        } => {
            let url = template::render(url, &ctx)?;
            let warehouse =
                RedshiftWarehouse::connect(&url, region.clone(), credentials.clone()).await?;
            Ok(Box::new(warehouse))
        }
        WarehouseConfig::Duckdb { path } => {
            let path = template::render(path, &ctx)?;
            Ok(Box::new(DuckDbEngine::open(&path)?))
        }
    }
}

/// Connect both sides of a pipeline
///
/// When source and warehouse name the same DuckDB database it is opened once
/// and shared through a second connection, since DuckDB locks its file.
pub async fn connect_databases(
    source: &SourceConfig,
    warehouse: &WarehouseConfig,
) -> Result<(Box<dyn SourceDatabase>, Box<dyn Warehouse>)> {
    if let (SourceConfig::Duckdb { path: source_path }, WarehouseConfig::Duckdb { path: warehouse_path }) =
        (source, warehouse)
    {
        let ctx = TemplateContext::new();
        let source_path = template::render(source_path, &ctx)?;
        if source_path == template::render(warehouse_path, &ctx)? {
            let engine = DuckDbEngine::open(&source_path)?;
            let shared = engine.try_clone()?;
            return Ok((Box::new(engine), Box::new(shared)));
        }
    }

    Ok((
        connect_source(source).await?,
        connect_warehouse(warehouse).await?,
    ))
}

/// Reject table names that cannot be spliced into SQL as-is
pub(crate) fn checked_identifier(name: &str) -> Result<&str> {
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(Error::config(format!("'{name}' is not a valid table name")))
    }
}

/// Strip trailing whitespace and semicolons so a query nests in `COPY (...)`
pub(crate) fn nested_query(query: &str) -> &str {
    query.trim().trim_end_matches(';').trim_end()
}

/// Mask the password of a connection URL for logging
pub fn connection_info(url: &str) -> String {
    let start = url.find("://").map_or(0, |i| i + 3);
    if let Some(at_pos) = url[start..].find('@').map(|i| i + start) {
        if let Some(colon_pos) = url[start..at_pos].rfind(':').map(|i| i + start) {
            let before_pass = &url[..=colon_pos];
            let after_at = &url[at_pos..];
            return format!("{before_pass}****{after_at}");
        }
    }
    url.to_string()
}
