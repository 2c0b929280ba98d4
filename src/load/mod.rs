//! Loader
//!
//! Lands uploaded objects in a per-chain staging table, then runs the job's
//! merge statement against the target.
//!
//! # Overview
//!
//! One load is two transactions on the same warehouse session:
//! 1. create the staging table like the target, truncate it, bulk copy every
//!    object into it, commit
//! 2. run the merge statement, commit
//!
//! Any failure rolls back the open transaction. The merge never runs after a
//! failed copy, so the target table is left untouched.

use crate::config::LoadSettings;
use crate::database::{CopyOptions, CopySource, Warehouse};
use crate::error::{Error, Result};
use crate::types::{ChainId, QueryKind};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Staging table of `table` within a chain
///
/// Dots and dashes become underscores so the name stays a plain identifier.
pub fn staging_table_name(table: &str, chain_id: &ChainId) -> String {
    format!(
        "staging_{}_{}",
        table.replace('.', "_"),
        chain_id.as_str().replace('-', "_")
    )
}

/// Result of loading one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Target table
    pub table: String,
    /// Staging table the objects were copied into
    pub staging_table: String,
    /// Merge strategy of the job
    pub query_kind: QueryKind,
    /// Rows copied into staging
    pub rows_copied: u64,
    /// Wall time of the load
    pub duration: Duration,
}

/// Runs the staging-then-merge sequence on one warehouse session
pub struct Loader {
    warehouse: Box<dyn Warehouse>,
    options: CopyOptions,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("options", &self.options)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Loader {
    /// Create a loader over an open warehouse session
    pub fn new(warehouse: Box<dyn Warehouse>, settings: &LoadSettings) -> Self {
        Self {
            warehouse,
            options: CopyOptions {
                max_errors: settings.max_errors,
            },
            timeout: None,
        }
    }

    /// Bound the whole load by `timeout`
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load the objects of `source` into `table` through its staging table
    ///
    /// `merge_query` is the rendered merge statement; it reads from the
    /// staging table and writes the target.
    pub async fn load(
        &mut self,
        table: &str,
        query_kind: QueryKind,
        merge_query: &str,
        chain_id: &ChainId,
        source: &CopySource,
    ) -> Result<LoadReport> {
        let staging = staging_table_name(table, chain_id);
        let started = Instant::now();

        let rows_copied = match self.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.run(table, &staging, merge_query, source))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        // The interrupted sequence may have left a transaction open
                        self.rollback_quietly().await;
                        return Err(Error::Timeout {
                            timeout_ms: limit.as_millis() as u64,
                        });
                    }
                }
            }
            None => self.run(table, &staging, merge_query, source).await?,
        };

        let report = LoadReport {
            table: table.to_string(),
            staging_table: staging,
            query_kind,
            rows_copied,
            duration: started.elapsed(),
        };
        info!(
            table,
            staging = %report.staging_table,
            kind = %query_kind,
            rows = rows_copied,
            duration_ms = report.duration.as_millis() as u64,
            "Load complete"
        );
        Ok(report)
    }

    async fn run(
        &mut self,
        table: &str,
        staging: &str,
        merge_query: &str,
        source: &CopySource,
    ) -> Result<u64> {
        self.warehouse.begin().await?;
        let rows = match self.stage(table, staging, source).await {
            Ok(rows) => rows,
            Err(e) => {
                self.rollback_quietly().await;
                return Err(e);
            }
        };
        debug!(staging, rows, "Staging committed");

        self.warehouse.begin().await?;
        if let Err(e) = self.merge(merge_query).await {
            self.rollback_quietly().await;
            return Err(e);
        }

        Ok(rows)
    }

    async fn stage(&mut self, table: &str, staging: &str, source: &CopySource) -> Result<u64> {
        self.warehouse.create_table_like(staging, table).await?;
        self.warehouse.truncate(staging).await?;
        let rows = self
            .warehouse
            .copy_in(staging, source, &self.options)
            .await?;
        self.warehouse.commit().await?;
        Ok(rows)
    }

    async fn merge(&mut self, merge_query: &str) -> Result<()> {
        self.warehouse.execute(merge_query).await?;
        self.warehouse.commit().await
    }

    async fn rollback_quietly(&mut self) {
        if let Err(e) = self.warehouse.rollback().await {
            warn!(error = %e, "Rollback failed");
        }
    }
}
