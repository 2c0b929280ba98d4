//! Pipeline types
//!
//! Per-table stage tracking and run reports.

use crate::types::{ChainId, RunMode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Step of the per-table pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Render,
    Export,
    Partition,
    Compress,
    Upload,
    Load,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Render => "render",
            Step::Export => "export",
            Step::Partition => "partition",
            Step::Compress => "compress",
            Step::Upload => "upload",
            Step::Load => "load",
        };
        f.write_str(name)
    }
}

/// Where a table is in the pipeline
///
/// Moves forward one state per completed step; `Failed` is reachable from
/// any state and records the step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TableStage {
    Init,
    Exported,
    Partitioned,
    Compressed,
    Uploaded,
    Loaded,
    Done,
    Failed { at: Step },
}

impl TableStage {
    /// Stage reached once `step` completes
    pub fn after(step: Step) -> Self {
        match step {
            Step::Render => TableStage::Init,
            Step::Export => TableStage::Exported,
            Step::Partition => TableStage::Partitioned,
            Step::Compress => TableStage::Compressed,
            Step::Upload => TableStage::Uploaded,
            Step::Load => TableStage::Loaded,
        }
    }

    /// Whether the table made it through every step
    pub fn is_done(self) -> bool {
        self == TableStage::Done
    }
}

impl fmt::Display for TableStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableStage::Init => write!(f, "init"),
            TableStage::Exported => write!(f, "exported"),
            TableStage::Partitioned => write!(f, "partitioned"),
            TableStage::Compressed => write!(f, "compressed"),
            TableStage::Uploaded => write!(f, "uploaded"),
            TableStage::Loaded => write!(f, "loaded"),
            TableStage::Done => write!(f, "done"),
            TableStage::Failed { at } => write!(f, "failed at {at}"),
        }
    }
}

/// Outcome of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    /// Last stage reached
    pub stage: TableStage,
    /// Chunks the export was split into
    pub chunks: usize,
    /// Size of the raw export
    pub bytes_exported: u64,
    /// Objects transferred by this run
    pub objects_uploaded: usize,
    /// Objects that already existed
    pub objects_skipped: usize,
    /// Rows copied into staging
    pub rows_copied: u64,
    /// Wall time spent on the table
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Failure with chain, table and step context
    pub error: Option<String>,
}

impl TableReport {
    /// Empty report for a table about to start
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            stage: TableStage::Init,
            chunks: 0,
            bytes_exported: 0,
            objects_uploaded: 0,
            objects_skipped: 0,
            rows_copied: 0,
            duration: Duration::ZERO,
            error: None,
        }
    }

    /// Whether the table finished
    pub fn is_success(&self) -> bool {
        self.stage.is_done() && self.error.is_none()
    }
}

/// Outcome of a run over one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub chain: ChainId,
    pub bucket: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    /// One report per table attempted, in job order
    pub tables: Vec<TableReport>,
}

impl RunReport {
    /// Whether every attempted table finished
    pub fn is_success(&self) -> bool {
        self.tables.iter().all(TableReport::is_success)
    }

    /// Tables that failed
    pub fn failed(&self) -> impl Iterator<Item = &TableReport> {
        self.tables.iter().filter(|t| !t.is_success())
    }

    /// Tables that finished
    pub fn succeeded(&self) -> usize {
        self.tables.iter().filter(|t| t.is_success()).count()
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
