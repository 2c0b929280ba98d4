//! CLI module
//!
//! Command-line interface for running pipelines.
//!
//! # Commands
//!
//! - `run` - Export, stage and load the jobs of one chain
//! - `validate` - Check a pipeline file
//! - `jobs` - List the configured jobs
//! - `upload` - Upload a local directory to a bucket

mod commands;
mod runner;

pub use commands::{Cli, Commands, OutputFormat};
pub use runner::Runner;
