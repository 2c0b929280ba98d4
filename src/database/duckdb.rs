//! DuckDB engine
//!
//! Implements both database seams on one DuckDB connection. Exports use
//! `COPY ... TO` with the shared delimited format; loads read the gzip
//! chunks back with `read_csv`, typed against the staging table's columns.
//! Objects on local storage are read from disk, `s3://` objects through the
//! httpfs extension.
//!
//! Statements run on tokio's blocking pool. Dropping an in-flight call, as a
//! missed deadline does, interrupts the statement on the connection.

use super::{
    checked_identifier, nested_query, CopyOptions, CopySource, ExportStats, SourceDatabase,
    Warehouse,
};
use crate::error::{Error, Result};
use crate::types::sql_literal;
use ::duckdb::{Connection, InterruptHandle};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Temp table the rejected rows of the last copy land in
const REJECTS_TABLE: &str = "chariot_reject_errors";

/// Temp table describing the scans of the last copy
const REJECTS_SCAN: &str = "chariot_reject_scans";

/// Database engine over a single DuckDB connection
pub struct DuckDbEngine {
    /// DuckDB connection, shared with the statement running on the blocking pool
    conn: Arc<Mutex<Connection>>,
    /// Interrupts whatever statement `conn` is running
    interrupt: Arc<InterruptHandle>,
    /// Database path (for logging)
    path: String,
    /// Whether httpfs has been loaded and configured
    cloud_configured: bool,
}

/// Cancels the statement of a dropped call
///
/// Marks the call cancelled so a statement that has not started yet is
/// skipped, and interrupts one that is running.
struct InterruptOnDrop {
    handle: Arc<InterruptHandle>,
    cancelled: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.cancelled.store(true, Ordering::SeqCst);
            self.handle.interrupt();
        }
    }
}

impl DuckDbEngine {
    /// Open a database file, or an in-memory database for `:memory:`
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| Error::config(format!("Failed to open DuckDB database '{path}': {e}")))?;

        Ok(Self::from_connection(conn, path))
    }

    /// Wrap an existing connection
    pub fn from_connection(conn: Connection, path: &str) -> Self {
        Self {
            interrupt: conn.interrupt_handle(),
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_string(),
            cloud_configured: false,
        }
    }

    /// Open a second handle on the same database
    pub fn try_clone(&self) -> Result<Self> {
        let conn = self.connection().try_clone()?;
        Ok(Self::from_connection(conn, &self.path))
    }

    /// Lock the underlying connection
    ///
    /// Waits for a statement still running on the blocking pool.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conn)
    }

    /// Database path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Load httpfs and configure S3 credentials from the environment
    pub fn configure_cloud_storage(&mut self) -> Result<()> {
        if self.cloud_configured {
            return Ok(());
        }

        let conn = self.connection();
        conn.execute_batch("INSTALL httpfs; LOAD httpfs;")
            .map_err(|e| Error::config(format!("Failed to load httpfs extension: {e}")))?;

        if let (Ok(key_id), Ok(secret)) = (
            std::env::var("AWS_ACCESS_KEY_ID"),
            std::env::var("AWS_SECRET_ACCESS_KEY"),
        ) {
            let region =
                std::env::var("AWS_DEFAULT_REGION").unwrap_or_else(|_| "us-east-1".to_string());

            conn.execute_batch(&format!(
                "SET s3_access_key_id = {}; SET s3_secret_access_key = {}; SET s3_region = {};",
                sql_literal(&key_id),
                sql_literal(&secret),
                sql_literal(&region)
            ))
            .map_err(|e| Error::config(format!("Failed to configure S3: {e}")))?;

            // Custom endpoint (MinIO, R2, ...)
            if let Ok(endpoint) = std::env::var("AWS_ENDPOINT") {
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://");
                conn.execute_batch(&format!(
                    "SET s3_endpoint = {}; SET s3_url_style = 'path';",
                    sql_literal(host)
                ))
                .map_err(|e| Error::config(format!("Failed to configure S3 endpoint: {e}")))?;
            }
        }
        drop(conn);

        self.cloud_configured = true;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut guard = InterruptOnDrop {
            handle: Arc::clone(&self.interrupt),
            cancelled: Arc::clone(&cancelled),
            armed: true,
        };

        let task = tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            if cancelled.load(Ordering::SeqCst) {
                return Err(Error::Other("DuckDB statement cancelled".to_string()));
            }
            f(&*conn)
        });
        let result = task
            .await
            .map_err(|e| Error::Other(format!("DuckDB task failed: {e}")));
        guard.armed = false;
        result?
    }

    /// Run one or more statements on the blocking pool
    async fn execute_batch(&self, sql: String) -> Result<()> {
        self.blocking(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Column names and types of a table, in declaration order
fn columns(conn: &Connection, table: &str) -> Result<Vec<(String, String)>> {
    let mut sql = String::from(
        "SELECT column_name, data_type FROM information_schema.columns WHERE table_name = ?",
    );
    let mut params = Vec::with_capacity(2);
    match table.rsplit_once('.') {
        Some((schema, name)) => {
            sql.push_str(" AND table_schema = ?");
            params.push(name);
            params.push(schema);
        }
        None => params.push(table),
    }
    sql.push_str(" ORDER BY ordinal_position");

    let mut stmt = conn.prepare(&sql)?;
    let columns = stmt
        .query_map(::duckdb::params_from_iter(params), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if columns.is_empty() {
        return Err(Error::warehouse(format!("Table '{table}' does not exist")));
    }
    Ok(columns)
}

/// Distinct rejected lines recorded by the last tolerant copy
fn rejected_rows(conn: &Connection) -> Result<u64> {
    let exists: i64 = conn.query_row(
        "SELECT count(*) FROM duckdb_tables() WHERE table_name = ?",
        [REJECTS_TABLE],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Ok(0);
    }

    let rejected: i64 = conn.query_row(
        &format!("SELECT count(*) FROM (SELECT DISTINCT file_id, line FROM {REJECTS_TABLE})"),
        [],
        |row| row.get(0),
    )?;
    Ok(rejected as u64)
}

/// Map an object URI onto something `read_csv` can open
fn object_location(uri: &str) -> Result<String> {
    if let Some(path) = uri.strip_prefix("file://") {
        Ok(path.to_string())
    } else if uri.starts_with("s3://") || !uri.contains("://") {
        Ok(uri.to_string())
    } else {
        Err(Error::warehouse(format!("DuckDB cannot read object '{uri}'")))
    }
}

#[async_trait]
impl SourceDatabase for DuckDbEngine {
    async fn export_delimited(&mut self, query: &str, dest: &Path) -> Result<ExportStats> {
        let dest_str = dest
            .to_str()
            .ok_or_else(|| Error::config(format!("Invalid export path: {}", dest.display())))?;

        let copy_sql = format!(
            "COPY ({}) TO {} (FORMAT CSV, DELIMITER '|', QUOTE '\"', FORCE_QUOTE *, HEADER false)",
            nested_query(query),
            sql_literal(dest_str)
        );
        tracing::debug!(path = %dest.display(), "Exporting query: {}", query);

        let target = dest.to_path_buf();
        let rows = self
            .blocking(move |conn| match conn.execute(&copy_sql, []) {
                Ok(rows) => Ok(rows as u64),
                Err(e) => {
                    let _ = std::fs::remove_file(&target);
                    Err(Error::source_query(format!("DuckDB export failed: {e}")))
                }
            })
            .await?;

        let bytes = tokio::fs::metadata(dest).await?.len();
        Ok(ExportStats {
            rows: Some(rows),
            bytes,
        })
    }
}

#[async_trait]
impl Warehouse for DuckDbEngine {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.execute_batch(sql.to_string()).await
    }

    async fn begin(&mut self) -> Result<()> {
        self.execute_batch("BEGIN TRANSACTION".to_string()).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute_batch("COMMIT".to_string()).await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute_batch("ROLLBACK".to_string()).await
    }

    async fn create_table_like(&mut self, staging: &str, target: &str) -> Result<()> {
        let staging = checked_identifier(staging)?;
        let target = checked_identifier(target)?;
        self.execute_batch(format!(
            "CREATE TABLE IF NOT EXISTS {staging} AS SELECT * FROM {target} LIMIT 0"
        ))
        .await
    }

    async fn truncate(&mut self, table: &str) -> Result<()> {
        let table = checked_identifier(table)?;
        self.execute_batch(format!("DELETE FROM {table}")).await
    }

    async fn copy_in(
        &mut self,
        table: &str,
        source: &CopySource,
        options: &CopyOptions,
    ) -> Result<u64> {
        let table = checked_identifier(table)?.to_string();
        if source.objects.is_empty() {
            return Ok(0);
        }

        let locations = source
            .objects
            .iter()
            .map(|uri| object_location(uri))
            .collect::<Result<Vec<_>>>()?;
        if locations.iter().any(|l| l.starts_with("s3://")) {
            self.configure_cloud_storage()?;
        }
        let max_errors = options.max_errors;
        tracing::debug!(table = %table, objects = locations.len(), "Copying into staging");

        self.blocking(move |conn| {
            let columns = columns(conn, &table)?
                .iter()
                .map(|(name, ty)| format!("{}: {}", sql_literal(name), sql_literal(ty)))
                .collect::<Vec<_>>()
                .join(", ");
            let files = locations
                .iter()
                .map(|l| sql_literal(l))
                .collect::<Vec<_>>()
                .join(", ");

            let mut read_options = format!(
                "columns = {{{columns}}}, delim = '|', quote = '\"', escape = '\"', \
                 header = false, auto_detect = false, compression = 'gzip'"
            );
            if max_errors > 0 {
                conn.execute_batch(&format!(
                    "DROP TABLE IF EXISTS {REJECTS_TABLE}; DROP TABLE IF EXISTS {REJECTS_SCAN};"
                ))?;
                read_options.push_str(&format!(
                    ", store_rejects = true, rejects_table = '{REJECTS_TABLE}', rejects_scan = '{REJECTS_SCAN}'"
                ));
            }

            let copy_sql =
                format!("INSERT INTO {table} SELECT * FROM read_csv([{files}], {read_options})");
            let rows = conn
                .execute(&copy_sql, [])
                .map_err(|e| Error::warehouse(format!("Copy into '{table}' failed: {e}")))?
                as u64;

            if max_errors > 0 {
                let rejected = rejected_rows(conn)?;
                if rejected > 0 {
                    tracing::warn!(table = %table, rejected, "Rows rejected during copy");
                }
                if rejected > max_errors {
                    return Err(Error::LoadRejected {
                        table,
                        rejected,
                        max_errors,
                    });
                }
            }

            Ok(rows)
        })
        .await
    }
}
