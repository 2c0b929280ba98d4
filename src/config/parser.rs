//! YAML parser for pipeline definitions
//!
//! Parses and validates pipeline files.

use crate::config::types::{ExportJob, PipelineConfig, StorageConfig, WarehouseConfig};
use crate::error::{Error, Result};
use crate::template;
use crate::types::{is_identifier, ChainId};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Variables a job query may reference besides `env.*`
const JOB_VARIABLES: [&str; 3] = ["chain_id", "table", "staging_table"];

/// Smallest part S3 accepts for all but the last part of a multipart upload
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Load a pipeline definition from a file path
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<PipelineConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound {
                path: path.display().to_string(),
            }
        } else {
            Error::config(format!(
                "Failed to read pipeline file '{}': {}",
                path.display(),
                e
            ))
        }
    })?;
    load_pipeline_from_str(&content)
}

/// Load a pipeline definition from a YAML string
pub fn load_pipeline_from_str(yaml: &str) -> Result<PipelineConfig> {
    let config: PipelineConfig = serde_yaml::from_str(yaml)?;

    validate_pipeline(&config)?;
    Ok(config)
}

/// Validate a pipeline definition
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    if config.jobs.is_empty() {
        return Err(Error::config("Pipeline must have at least one job"));
    }

    let tables: HashSet<_> = config.jobs.iter().map(|j| &j.table).collect();
    if tables.len() != config.jobs.len() {
        return Err(Error::config("Duplicate job tables found"));
    }

    for job in &config.jobs {
        validate_job(job)?;
    }

    let sample = ChainId::new("0")?;
    config.bucket_name(&sample)?;

    // Staging names fold '.' into '_'
    let mut staging = HashSet::new();
    for job in &config.jobs {
        if !staging.insert(job.staging_table(&sample)) {
            return Err(Error::config(format!(
                "Table '{}' shares its staging table with another job",
                job.table
            )));
        }
    }

    if config.partition.chunk_size_bytes == 0 {
        return Err(Error::invalid_value(
            "partition.chunk_size_bytes",
            "must be greater than zero",
        ));
    }

    let upload = &config.upload;
    if upload.workers == 0 {
        return Err(Error::invalid_value("upload.workers", "must be at least 1"));
    }
    if upload.max_attempts == 0 {
        return Err(Error::invalid_value(
            "upload.max_attempts",
            "must be at least 1",
        ));
    }
    if upload.part_size_bytes < MIN_PART_SIZE {
        return Err(Error::invalid_value(
            "upload.part_size_bytes",
            format!("must be at least {MIN_PART_SIZE} bytes"),
        ));
    }
    if upload.part_size_bytes > upload.multipart_threshold_bytes {
        return Err(Error::invalid_value(
            "upload.part_size_bytes",
            "cannot exceed upload.multipart_threshold_bytes",
        ));
    }

    match (&config.warehouse, &config.storage) {
        (WarehouseConfig::Redshift { .. }, StorageConfig::S3 { .. }) => {}
        (WarehouseConfig::Redshift { .. }, _) => {
            return Err(Error::config(
                "A redshift warehouse can only load from s3 storage",
            ));
        }
        (WarehouseConfig::Duckdb { .. }, StorageConfig::Memory) => {
            return Err(Error::config(
                "A duckdb warehouse cannot read from memory storage",
            ));
        }
        (WarehouseConfig::Duckdb { .. }, _) => {}
    }

    Ok(())
}

/// Validate a job definition
fn validate_job(job: &ExportJob) -> Result<()> {
    if !is_identifier(&job.table) {
        return Err(Error::config(format!(
            "Job table '{}' is not a valid table name",
            job.table
        )));
    }

    for (field, query) in [
        ("export_query", &job.export_query),
        ("merge_query", &job.merge_query),
    ] {
        if query.trim().is_empty() {
            return Err(Error::config(format!(
                "Job '{}' {field} cannot be empty",
                job.table
            )));
        }

        for var in template::extract_variables(query) {
            if !JOB_VARIABLES.contains(&var.as_str()) && !var.starts_with("env.") {
                return Err(Error::config(format!(
                    "Job '{}' {field} references unknown variable '{var}'",
                    job.table
                )));
            }
        }
    }

    Ok(())
}
