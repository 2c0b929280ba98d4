//! Pipeline configuration module
//!
//! Parse pipeline definitions from YAML files.
//!
//! # Overview
//!
//! The config module provides:
//! - `PipelineConfig` - Sources, sinks, stage policies and the job list
//! - `ExportJob` - One table moved by the pipeline
//! - YAML parsing with validation

mod parser;
mod types;

pub use parser::{load_pipeline, load_pipeline_from_str, validate_pipeline};
pub use types::{
    CopyCredentials, ExportJob, LoadSettings, LoggingSettings, PartitionSettings, PipelineConfig,
    SourceConfig, StorageConfig, TimeoutSettings, UploadSettings, WarehouseConfig,
};
