//! CLI commands and argument parsing

use crate::types::RunMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Chariot batch pipeline CLI
#[derive(Parser, Debug)]
#[command(name = "chariot")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pipeline definition file (YAML)
    #[arg(short, long, global = true, default_value = "pipeline.yaml")]
    pub pipeline: PathBuf,

    /// Log at debug level regardless of the pipeline file
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "json")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Export, stage and load every table for one chain
    Run {
        /// Chain identifier
        #[arg(long)]
        chain: String,

        /// Only process these tables (repeatable, default = every job)
        #[arg(long = "table")]
        tables: Vec<String>,

        /// Override the run mode of the pipeline file
        #[arg(long, value_enum)]
        mode: Option<RunMode>,
    },

    /// Check the pipeline file without connecting to anything
    Validate,

    /// List the configured jobs
    Jobs {
        /// Render bucket and staging names for this chain
        #[arg(long)]
        chain: Option<String>,
    },

    /// Upload every file of a local directory to a bucket
    Upload {
        /// Target bucket
        #[arg(long)]
        bucket: String,

        /// Directory holding the files
        #[arg(long)]
        dir: PathBuf,

        /// Key prefix for the objects
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON output (one message per line)
    Json,
    /// Human-readable JSON
    Pretty,
}
