//! CLI runner - executes commands

use crate::cli::commands::{Cli, Commands, OutputFormat};
use crate::config::{load_pipeline, LoggingSettings, PipelineConfig};
use crate::error::{Error, Result};
use crate::logging;
use crate::pipeline::{Pipeline, RunOptions, RunReport};
use crate::storage::connect_storage;
use crate::types::{ChainId, LogLevel, RunMode};
use crate::upload::{UploadReport, Uploader};
use serde_json::{json, Value};
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

/// CLI runner
pub struct Runner {
    cli: Cli,
}

impl Runner {
    /// Create a new runner
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run the CLI command
    pub async fn run(&self) -> Result<()> {
        match &self.cli.command {
            Commands::Run {
                chain,
                tables,
                mode,
            } => self.run_chain(chain, tables, *mode).await,
            Commands::Validate => self.validate(),
            Commands::Jobs { chain } => self.jobs(chain.as_deref()),
            Commands::Upload {
                bucket,
                dir,
                prefix,
            } => self.upload(bucket, dir, prefix).await,
        }
    }

    /// Run the pipeline for one chain
    async fn run_chain(&self, chain: &str, tables: &[String], mode: Option<RunMode>) -> Result<()> {
        let config = self.load_pipeline()?;
        let _guard = self.init_logging(&config.logging)?;
        let chain_id = ChainId::new(chain)?;

        let mut pipeline = Pipeline::connect(config).await?;
        let options = RunOptions {
            mode,
            tables: tables.to_vec(),
        };
        let report = pipeline.run(&chain_id, &options).await?;

        self.output_message(&run_message(&report));

        let failed: Vec<&str> = report.failed().map(|t| t.table.as_str()).collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "Chain {chain_id}: {} of {} tables failed ({})",
                failed.len(),
                report.tables.len(),
                failed.join(", ")
            )))
        }
    }

    /// Validate the pipeline file
    fn validate(&self) -> Result<()> {
        let config = self.load_pipeline()?;

        self.output_message(&json!({
            "type": "LOG",
            "log": {
                "level": "INFO",
                "message": format!(
                    "Pipeline '{}' is valid with {} jobs",
                    self.cli.pipeline.display(),
                    config.jobs.len()
                )
            }
        }));

        Ok(())
    }

    /// List configured jobs
    fn jobs(&self, chain: Option<&str>) -> Result<()> {
        let config = self.load_pipeline()?;
        let chain_id = chain.map(ChainId::new).transpose()?;

        self.output_message(&jobs_message(&config, chain_id.as_ref())?);
        Ok(())
    }

    /// Upload a local directory with the pipeline's storage and retry settings
    async fn upload(&self, bucket: &str, dir: &Path, prefix: &str) -> Result<()> {
        let config = self.load_pipeline()?;
        let _guard = self.init_logging(&config.logging)?;

        if !dir.is_dir() {
            return Err(Error::FileNotFound {
                path: dir.display().to_string(),
            });
        }

        let storage = connect_storage(&config.storage).await?;
        let uploader = Uploader::from_settings(storage, &config.upload, config.storage.region());
        uploader.ensure_bucket(bucket).await?;
        let report = uploader.upload_directory(bucket, prefix, dir).await?;

        info!(
            bucket,
            uploaded = report.uploaded(),
            skipped = report.skipped(),
            "Directory uploaded"
        );
        self.output_message(&upload_message(bucket, &report));
        Ok(())
    }

    fn load_pipeline(&self) -> Result<PipelineConfig> {
        load_pipeline(&self.cli.pipeline)
    }

    fn init_logging(&self, settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
        let mut settings = settings.clone();
        if self.cli.verbose {
            settings.level = LogLevel::Debug;
        }
        logging::init(&settings)
    }

    /// Output a message
    fn output_message(&self, msg: &Value) {
        match self.cli.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string(msg).unwrap_or_default());
            }
            OutputFormat::Pretty => {
                println!("{}", serde_json::to_string_pretty(msg).unwrap_or_default());
            }
        }
    }
}

fn run_message(report: &RunReport) -> Value {
    json!({
        "type": "RUN_REPORT",
        "status": if report.is_success() { "SUCCEEDED" } else { "FAILED" },
        "report": report,
    })
}

fn jobs_message(config: &PipelineConfig, chain_id: Option<&ChainId>) -> Result<Value> {
    let bucket = chain_id.map(|id| config.bucket_name(id)).transpose()?;
    let jobs: Vec<Value> = config
        .jobs
        .iter()
        .map(|job| {
            let mut entry = json!({
                "table": job.table,
                "query_kind": job.query_kind.to_string(),
                "object_prefix": job.object_prefix(),
            });
            if let Some(id) = chain_id {
                entry["staging_table"] = json!(job.staging_table(id));
            }
            entry
        })
        .collect();

    Ok(json!({
        "type": "JOBS",
        "mode": config.mode.to_string(),
        "bucket": bucket,
        "jobs": jobs,
    }))
}

fn upload_message(bucket: &str, report: &UploadReport) -> Value {
    let objects: Vec<Value> = report
        .outcomes
        .iter()
        .map(|o| {
            json!({
                "key": o.key,
                "uri": o.uri,
                "skipped": o.skipped,
                "attempts": o.attempts,
            })
        })
        .collect();

    json!({
        "type": "UPLOAD_REPORT",
        "bucket": bucket,
        "uploaded": report.uploaded(),
        "skipped": report.skipped(),
        "objects": objects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_pipeline_from_str;
    use crate::pipeline::{TableReport, TableStage};
    use crate::upload::UploadOutcome;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    const PIPELINE: &str = r#"
bucket_template: "etl-{{ chain_id }}"
source:
  type: duckdb
  path: source.db
warehouse:
  type: duckdb
  path: warehouse.db
storage:
  type: local
  root: ./objects
jobs:
  - table: orders
    query_kind: upsert
    export_query: "SELECT * FROM orders"
    merge_query: "INSERT INTO orders SELECT * FROM {{ staging_table }}"
  - table: sales.items
    export_query: "SELECT * FROM items"
    merge_query: "INSERT INTO sales.items SELECT * FROM {{ staging_table }}"
"#;

    #[test]
    fn test_jobs_message_with_chain() {
        let config = load_pipeline_from_str(PIPELINE).unwrap();
        let chain = ChainId::new("chain-9").unwrap();

        let msg = jobs_message(&config, Some(&chain)).unwrap();

        assert_eq!(msg["bucket"], "etl-chain-9");
        assert_eq!(msg["mode"], "all");
        assert_eq!(msg["jobs"][0]["table"], "orders");
        assert_eq!(msg["jobs"][0]["query_kind"], "upsert");
        assert_eq!(msg["jobs"][0]["staging_table"], "staging_orders_chain_9");
        assert_eq!(msg["jobs"][1]["object_prefix"], "sales.items/");
        assert_eq!(msg["jobs"][1]["staging_table"], "staging_sales_items_chain_9");
    }

    #[test]
    fn test_jobs_message_without_chain() {
        let config = load_pipeline_from_str(PIPELINE).unwrap();

        let msg = jobs_message(&config, None).unwrap();

        assert!(msg["bucket"].is_null());
        assert!(msg["jobs"][0].get("staging_table").is_none());
    }

    #[test]
    fn test_run_message_status() {
        let mut failed = TableReport::new("orders");
        failed.stage = TableStage::Failed {
            at: crate::pipeline::Step::Upload,
        };
        failed.error = Some("boom".to_string());
        let report = RunReport {
            chain: ChainId::new("7").unwrap(),
            bucket: "chain-7".to_string(),
            mode: RunMode::All,
            started_at: Utc::now(),
            tables: vec![failed],
        };

        let msg = run_message(&report);

        assert_eq!(msg["status"], "FAILED");
        assert_eq!(msg["report"]["tables"][0]["stage"]["state"], "failed");
        assert_eq!(msg["report"]["tables"][0]["stage"]["at"], "upload");
        assert_eq!(msg["report"]["chain"], "7");
    }

    #[test]
    fn test_upload_message() {
        let report = UploadReport {
            outcomes: vec![
                UploadOutcome {
                    key: "a.gz".to_string(),
                    uri: "file:///objects/b/a.gz".to_string(),
                    skipped: false,
                    attempts: 2,
                },
                UploadOutcome {
                    key: "b.gz".to_string(),
                    uri: "file:///objects/b/b.gz".to_string(),
                    skipped: true,
                    attempts: 0,
                },
            ],
        };

        let msg = upload_message("b", &report);

        assert_eq!(msg["uploaded"], 1);
        assert_eq!(msg["skipped"], 1);
        assert_eq!(msg["objects"][0]["attempts"], 2);
    }
}
