//! Exporter
//!
//! Streams a table's query result to `<dest_dir>/<table>.csv` through a
//! [`SourceDatabase`]. Source errors are never retried.

use crate::database::SourceDatabase;
use crate::error::{Error, Result};
use crate::types::{Artifact, ArtifactStage};
use std::path::Path;
use std::time::Duration;

/// Export `query` for `table` into `dest_dir`
///
/// The directory is created if absent. On failure, including a missed
/// deadline, no partial artifact is left behind.
pub async fn export(
    source: &mut dyn SourceDatabase,
    table: &str,
    query: &str,
    dest_dir: &Path,
    deadline: Option<Duration>,
) -> Result<Artifact> {
    tokio::fs::create_dir_all(dest_dir).await?;
    let dest = dest_dir.join(format!("{table}.csv"));

    let stats = match deadline {
        Some(limit) => match tokio::time::timeout(limit, source.export_delimited(query, &dest)).await
        {
            Ok(result) => result?,
            Err(_) => {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(Error::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                });
            }
        },
        None => source.export_delimited(query, &dest).await?,
    };

    tracing::info!(
        table,
        bytes = stats.bytes,
        rows = stats.rows,
        path = %dest.display(),
        "Export complete"
    );

    Artifact::from_path(table, ArtifactStage::Raw, dest)
}
