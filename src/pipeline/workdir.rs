//! Per-chain working directories
//!
//! Raw exports and chunks live under `<root>/csv/<chain>`, compressed chunks
//! under `<root>/gzip/<chain>`. Both are emptied before each table so only one
//! table's artifacts exist at a time, and removed when the guard drops unless
//! artifacts are kept.

use crate::error::Result;
use crate::types::ChainId;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Working directories of one chain, removed on drop
#[derive(Debug)]
pub struct WorkDir {
    csv: PathBuf,
    gzip: PathBuf,
    keep: bool,
}

impl WorkDir {
    /// Directories for `chain_id` under `root`; nothing is created yet
    pub fn new(root: &Path, chain_id: &ChainId, keep: bool) -> Self {
        Self {
            csv: root.join("csv").join(chain_id.as_str()),
            gzip: root.join("gzip").join(chain_id.as_str()),
            keep,
        }
    }

    /// Directory for raw exports and their chunks
    pub fn csv(&self) -> &Path {
        &self.csv
    }

    /// Directory for compressed chunks
    pub fn gzip(&self) -> &Path {
        &self.gzip
    }

    /// Clear and recreate both directories
    pub fn reset(&self) -> Result<()> {
        for dir in [&self.csv, &self.gzip] {
            remove_if_present(dir)?;
            std::fs::create_dir_all(dir)?;
        }
        debug!(csv = %self.csv.display(), gzip = %self.gzip.display(), "Reset working directories");
        Ok(())
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        for dir in [&self.csv, &self.gzip] {
            if let Err(e) = remove_if_present(dir) {
                warn!(dir = %dir.display(), error = %e, "Failed to remove working directory");
            }
        }
    }
}

fn remove_if_present(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
