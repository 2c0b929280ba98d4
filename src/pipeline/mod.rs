//! Pipeline orchestrator
//!
//! Sequences the stages of every table of a chain.
//!
//! # Overview
//!
//! A run over one chain:
//! 1. renders the bucket name, creates the bucket if needed and purges it
//! 2. for each selected job: reset the working directories, render the
//!    queries, export, partition, compress, upload, load
//! 3. removes the working directories (unless artifacts are kept) and
//!    returns a [`RunReport`]
//!
//! Table failures are recorded in the report; whether the run continues
//! depends on the [`RunMode`]. Only failures before the first table (bucket,
//! job selection) abort the run with an error.

mod types;
mod workdir;

pub use types::{RunReport, Step, TableReport, TableStage};
pub use workdir::WorkDir;

use crate::compress::compress_all;
use crate::config::{ExportJob, PipelineConfig};
use crate::database::{connect_databases, CopySource, SourceDatabase, Warehouse};
use crate::error::{Error, Result};
use crate::export::export;
use crate::load::Loader;
use crate::partition::partition;
use crate::storage::{connect_storage, ObjectStorage};
use crate::template::{self, TemplateContext};
use crate::types::{ChainId, RunMode};
use crate::upload::Uploader;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, Instrument};

/// Per-run overrides of the pipeline file
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the configured mode
    pub mode: Option<RunMode>,
    /// Restrict the run to these tables (empty = every job)
    pub tables: Vec<String>,
}

type StepResult<T> = std::result::Result<T, (Step, Error)>;

fn at(step: Step) -> impl FnOnce(Error) -> (Step, Error) {
    move |e| (step, e)
}

fn join_error(step: Step) -> impl FnOnce(tokio::task::JoinError) -> (Step, Error) {
    move |e| (step, Error::Other(format!("{step} task failed: {e}")))
}

/// Runs configured jobs end to end
pub struct Pipeline {
    config: PipelineConfig,
    source: Box<dyn SourceDatabase>,
    uploader: Uploader,
    loader: Loader,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("jobs", &self.config.jobs.len())
            .field("uploader", &self.uploader)
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Connect every adapter named by the pipeline file
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let (source, warehouse) = connect_databases(&config.source, &config.warehouse).await?;
        let storage = connect_storage(&config.storage).await?;
        Ok(Self::new(config, source, storage, warehouse))
    }

    /// Assemble a pipeline from already-connected adapters
    pub fn new(
        config: PipelineConfig,
        source: Box<dyn SourceDatabase>,
        storage: Arc<dyn ObjectStorage>,
        warehouse: Box<dyn Warehouse>,
    ) -> Self {
        let uploader = Uploader::from_settings(storage, &config.upload, config.storage.region());
        let loader = Loader::new(warehouse, &config.load)
            .with_timeout(config.timeouts.load_secs.map(Duration::from_secs));

        Self {
            config,
            source,
            uploader,
            loader,
        }
    }

    /// The pipeline definition
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Jobs a run would process, in order
    pub fn select_jobs(&self, options: &RunOptions) -> Result<Vec<ExportJob>> {
        for table in &options.tables {
            if self.config.job(table).is_none() {
                return Err(Error::invalid_value(
                    "table",
                    format!("no job is configured for table '{table}'"),
                ));
            }
        }

        let mut jobs: Vec<ExportJob> = self
            .config
            .jobs
            .iter()
            .filter(|job| options.tables.is_empty() || options.tables.contains(&job.table))
            .cloned()
            .collect();

        if options.mode.unwrap_or(self.config.mode) == RunMode::FirstTable {
            jobs.truncate(1);
        }
        Ok(jobs)
    }

    /// Run the selected jobs for `chain_id`
    pub async fn run(&mut self, chain_id: &ChainId, options: &RunOptions) -> Result<RunReport> {
        let mode = options.mode.unwrap_or(self.config.mode);
        let jobs = self.select_jobs(options)?;
        let bucket = self.config.bucket_name(chain_id)?;
        let started_at = Utc::now();

        info!(chain = %chain_id, bucket, %mode, tables = jobs.len(), "Starting run");

        let bucket_uri = self.uploader.ensure_bucket(&bucket).await?;
        let purged = self.uploader.purge_bucket(&bucket).await?;
        info!(chain = %chain_id, bucket = %bucket_uri, purged, "Bucket ready");

        let workdir = WorkDir::new(&self.config.work_dir, chain_id, self.config.keep_artifacts);
        let mut tables = Vec::with_capacity(jobs.len());

        for job in &jobs {
            let span = info_span!("table", chain = %chain_id, table = %job.table);
            let report = self
                .run_table(job, chain_id, &bucket, &workdir)
                .instrument(span)
                .await;
            let failed = !report.is_success();
            tables.push(report);

            if failed && mode == RunMode::FailFast {
                info!(chain = %chain_id, "Stopping run after failed table");
                break;
            }
        }
        drop(workdir);

        let report = RunReport {
            chain: chain_id.clone(),
            bucket,
            mode,
            started_at,
            tables,
        };
        info!(
            chain = %chain_id,
            succeeded = report.succeeded(),
            failed = report.failed().count(),
            "Run finished"
        );
        Ok(report)
    }

    async fn run_table(
        &mut self,
        job: &ExportJob,
        chain_id: &ChainId,
        bucket: &str,
        workdir: &WorkDir,
    ) -> TableReport {
        let started = Instant::now();
        let mut report = TableReport::new(&job.table);

        let result = self
            .process_table(job, chain_id, bucket, workdir, &mut report)
            .await;
        report.duration = started.elapsed();

        match result {
            Ok(()) => {
                report.stage = TableStage::Done;
                info!(
                    chunks = report.chunks,
                    bytes = report.bytes_exported,
                    uploaded = report.objects_uploaded,
                    skipped = report.objects_skipped,
                    rows = report.rows_copied,
                    duration_ms = report.duration.as_millis() as u64,
                    "Table done"
                );
            }
            Err((step, e)) => {
                let kind = e.kind();
                let e = e.at_stage(&job.table, step);
                error!(chain = %chain_id, %step, %kind, error = %e, "Table failed");
                report.stage = TableStage::Failed { at: step };
                report.error = Some(e.to_string());
            }
        }
        report
    }

    async fn process_table(
        &mut self,
        job: &ExportJob,
        chain_id: &ChainId,
        bucket: &str,
        workdir: &WorkDir,
        report: &mut TableReport,
    ) -> StepResult<()> {
        let staging = job.staging_table(chain_id);
        let ctx = TemplateContext::for_job(chain_id.as_str(), &job.table, &staging);
        let export_query = template::render(&job.export_query, &ctx).map_err(at(Step::Render))?;
        let merge_query = template::render(&job.merge_query, &ctx).map_err(at(Step::Render))?;

        workdir.reset().map_err(at(Step::Export))?;
        let deadline = self.config.timeouts.export_secs.map(Duration::from_secs);
        let artifact = export(
            self.source.as_mut(),
            &job.table,
            &export_query,
            workdir.csv(),
            deadline,
        )
        .await
        .map_err(at(Step::Export))?;
        report.bytes_exported = artifact.size;
        advance(report, Step::Export);

        let threshold = self.config.partition.chunk_size_bytes;
        let chunks = tokio::task::spawn_blocking(move || partition(&artifact, threshold))
            .await
            .map_err(join_error(Step::Partition))?
            .map_err(at(Step::Partition))?;
        report.chunks = chunks.len();
        advance(report, Step::Partition);

        let gzip_dir = workdir.gzip().to_path_buf();
        tokio::task::spawn_blocking(move || compress_all(&chunks, &gzip_dir))
            .await
            .map_err(join_error(Step::Compress))?
            .map_err(at(Step::Compress))?;
        advance(report, Step::Compress);

        let prefix = job.object_prefix();
        let uploaded = self
            .uploader
            .upload_directory(bucket, &prefix, workdir.gzip())
            .await
            .map_err(at(Step::Upload))?;
        report.objects_uploaded = uploaded.uploaded();
        report.objects_skipped = uploaded.skipped();
        advance(report, Step::Upload);

        let source = self
            .copy_source(bucket, &prefix)
            .await
            .map_err(at(Step::Load))?;
        let loaded = self
            .loader
            .load(&job.table, job.query_kind, &merge_query, chain_id, &source)
            .await
            .map_err(at(Step::Load))?;
        report.rows_copied = loaded.rows_copied;
        advance(report, Step::Load);

        Ok(())
    }

    /// Every object under `prefix`, as the warehouse addresses it
    async fn copy_source(&self, bucket: &str, prefix: &str) -> Result<CopySource> {
        let storage = self.uploader.storage();
        let keys = storage.list(bucket, prefix).await?;
        if keys.is_empty() {
            return Err(Error::warehouse(format!(
                "No objects under '{}' to load",
                storage.uri(bucket, prefix)
            )));
        }

        Ok(CopySource {
            prefix: storage.uri(bucket, prefix),
            objects: keys.iter().map(|key| storage.uri(bucket, key)).collect(),
        })
    }
}

fn advance(report: &mut TableReport, step: Step) {
    report.stage = TableStage::after(step);
    info!(stage = %report.stage, "Stage complete");
}

#[cfg(test)]
mod tests;
