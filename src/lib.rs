// Allow common clippy pedantic lints that aren't critical for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::ref_option)]
#![allow(clippy::unused_self)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unused_async)]

//! # Chariot
//!
//! A batch pipeline that moves relational tables from a source database
//! through object storage into an analytical warehouse, one chain at a time.
//!
//! ## Features
//!
//! - **Streaming Export**: Query results written straight to delimited text
//! - **Safe Chunking**: Splits large exports only at record boundaries
//! - **Idempotent Upload**: Existing objects are never overwritten
//! - **Retry Policy**: Constant, linear or exponential backoff on transient failures
//! - **Staged Loads**: Bulk copy into a staging table, merge in one transaction
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chariot::{load_pipeline, ChainId, Pipeline, Result, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = load_pipeline("pipeline.yaml")?;
//!     let mut pipeline = Pipeline::connect(config).await?;
//!
//!     let report = pipeline
//!         .run(&ChainId::new("42")?, &RunOptions::default())
//!         .await?;
//!     assert!(report.is_success());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Pipeline (per chain)                     │
//! │   bucket → for each table: render → export → ... → load         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//! ┌──────────┬───────────┬───────┴───────┬───────────┬─────────────┐
//! │  Export  │ Partition │   Compress    │  Upload   │    Load     │
//! ├──────────┼───────────┼───────────────┼───────────┼─────────────┤
//! │ Postgres │ Record    │ gzip          │ S3        │ Redshift    │
//! │ DuckDB   │ boundaries│               │ Local     │ DuckDB      │
//! │          │           │               │ Retry     │ Staging     │
//! └──────────┴───────────┴───────────────┴───────────┴─────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(missing_docs)] // TODO: Add docs before 1.0 release

// ============================================================================
// Module declarations
// ============================================================================

/// Error types and classification
pub mod error;

/// Common types and type aliases
pub mod types;

/// Template interpolation
pub mod template;

/// Pipeline definition and YAML loader
pub mod config;

/// Source and warehouse database adapters
pub mod database;

/// Object storage backends
pub mod storage;

/// Query export to delimited text
pub mod export;

/// Record-boundary chunking
pub mod partition;

/// Gzip compression of chunks
pub mod compress;

/// Object upload with retry
pub mod upload;

/// Staged warehouse loads
pub mod load;

/// Pipeline orchestrator
pub mod pipeline;

/// Log subscriber setup
pub mod logging;

/// Command-line interface
pub mod cli;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{Error, ErrorKind, Result};
pub use types::*;

// Re-export commonly used types
pub use config::{load_pipeline, load_pipeline_from_str, PipelineConfig};
pub use pipeline::{Pipeline, RunOptions, RunReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
