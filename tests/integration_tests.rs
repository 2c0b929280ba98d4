//! Integration tests using DuckDB files and local object storage
//!
//! Tests the full end-to-end flow: YAML pipeline → export → chunks → gzip
//! objects → staged warehouse load

use chariot::compress::{compress_all, decompress};
use chariot::partition::partition;
use chariot::storage::{LocalStorage, ObjectStorage};
use chariot::upload::{RetryPolicy, UploadConfig, Uploader};
use chariot::{
    load_pipeline, Artifact, ArtifactStage, ChainId, ErrorKind, Pipeline, RunMode, RunOptions,
};
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

const SOURCE_SETUP: &str = "
    CREATE TABLE src_orders (chain_id INTEGER, id INTEGER, note VARCHAR);
    INSERT INTO src_orders VALUES
        (7, 1, 'plain'),
        (7, 2, 'with | pipe'),
        (7, 3, 'two
lines'),
        (7, 4, NULL),
        (8, 1, 'other chain');
";

const WAREHOUSE_SETUP: &str = "
    CREATE TABLE orders (chain_id INTEGER, id INTEGER, note VARCHAR);
    INSERT INTO orders VALUES (7, 99, 'stale'), (8, 1, 'untouched');
";

fn create_db(path: &Path, sql: &str) {
    let conn = duckdb::Connection::open(path).unwrap();
    conn.execute_batch(sql).unwrap();
}

fn write_pipeline(dir: &Path, source: &Path, warehouse: &Path, extra: &str) -> PathBuf {
    let yaml = format!(
        r#"
work_dir: "{work}"
bucket_template: "etl-{{{{ chain_id }}}}"
source:
  type: duckdb
  path: "{source}"
warehouse:
  type: duckdb
  path: "{warehouse}"
storage:
  type: local
  root: "{objects}"
upload:
  initial_backoff_ms: 1
logging:
  file: null
  console: false
{extra}
jobs:
  - table: orders
    query_kind: replace
    export_query: "SELECT * FROM src_orders WHERE chain_id = {{{{ chain_id }}}} ORDER BY id"
    merge_query: "DELETE FROM orders WHERE chain_id = {{{{ chain_id }}}}; INSERT INTO orders SELECT * FROM {{{{ staging_table }}}};"
"#,
        work = dir.join("work").display(),
        source = source.display(),
        warehouse = warehouse.display(),
        objects = dir.join("objects").display(),
    );
    let path = dir.join("pipeline.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

fn orders(path: &Path) -> Vec<(i32, i32, Option<String>)> {
    let conn = duckdb::Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare("SELECT chain_id, id, note FROM orders ORDER BY chain_id, id")
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
}

fn expected_orders() -> Vec<(i32, i32, Option<String>)> {
    vec![
        (7, 1, Some("plain".to_string())),
        (7, 2, Some("with | pipe".to_string())),
        (7, 3, Some("two\nlines".to_string())),
        (7, 4, None),
        (8, 1, Some("untouched".to_string())),
    ]
}

// ============================================================================
// Pipeline Tests
// ============================================================================

#[tokio::test]
async fn test_pipeline_file_end_to_end() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source.db");
    let warehouse = dir.path().join("warehouse.db");
    create_db(&source, SOURCE_SETUP);
    create_db(&warehouse, WAREHOUSE_SETUP);
    let pipeline_file = write_pipeline(dir.path(), &source, &warehouse, "");

    let config = load_pipeline(&pipeline_file).unwrap();
    let mut pipeline = Pipeline::connect(config).await.unwrap();
    let report = pipeline
        .run(&ChainId::new("7").unwrap(), &RunOptions::default())
        .await
        .unwrap();
    drop(pipeline);

    assert!(report.is_success(), "{:?}", report.tables);
    assert_eq!(report.bucket, "etl-7");
    assert_eq!(report.mode, RunMode::All);
    assert_eq!(report.tables[0].rows_copied, 4);
    assert!(dir
        .path()
        .join("objects/etl-7/orders/orders.csv.gz")
        .is_file());
    assert!(!dir.path().join("work/csv/7").exists());
    assert_eq!(orders(&warehouse), expected_orders());
}

#[tokio::test]
async fn test_shared_duckdb_file() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("local.db");
    create_db(&db, &format!("{SOURCE_SETUP}{WAREHOUSE_SETUP}"));
    let pipeline_file = write_pipeline(dir.path(), &db, &db, "");

    let config = load_pipeline(&pipeline_file).unwrap();
    let mut pipeline = Pipeline::connect(config).await.unwrap();
    let report = pipeline
        .run(&ChainId::new("7").unwrap(), &RunOptions::default())
        .await
        .unwrap();
    drop(pipeline);

    assert!(report.is_success(), "{:?}", report.tables);
    assert_eq!(orders(&db), expected_orders());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source.db");
    let warehouse = dir.path().join("warehouse.db");
    create_db(&source, SOURCE_SETUP);
    create_db(&warehouse, WAREHOUSE_SETUP);
    let pipeline_file = write_pipeline(dir.path(), &source, &warehouse, "");
    let chain = ChainId::new("7").unwrap();

    let mut pipeline = Pipeline::connect(load_pipeline(&pipeline_file).unwrap())
        .await
        .unwrap();
    pipeline.run(&chain, &RunOptions::default()).await.unwrap();
    let report = pipeline.run(&chain, &RunOptions::default()).await.unwrap();
    drop(pipeline);

    assert!(report.is_success());
    assert_eq!(orders(&warehouse), expected_orders());
}

#[tokio::test]
async fn test_missing_source_table_reports_export_failure() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source.db");
    let warehouse = dir.path().join("warehouse.db");
    create_db(&source, "CREATE TABLE unrelated (x INTEGER);");
    create_db(&warehouse, WAREHOUSE_SETUP);
    let pipeline_file = write_pipeline(dir.path(), &source, &warehouse, "");

    let mut pipeline = Pipeline::connect(load_pipeline(&pipeline_file).unwrap())
        .await
        .unwrap();
    let report = pipeline
        .run(&ChainId::new("7").unwrap(), &RunOptions::default())
        .await
        .unwrap();
    drop(pipeline);

    assert!(!report.is_success());
    let error = report.tables[0].error.as_deref().unwrap();
    assert!(error.contains("orders"), "{error}");
    assert!(error.contains("export"), "{error}");
    assert_eq!(orders(&warehouse).len(), 2);
}

#[test]
fn test_invalid_pipeline_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pipeline.yaml");
    std::fs::write(&path, "source: { type: duckdb, path: a.db }\njobs: []\n").unwrap();

    let err = load_pipeline(&path).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Config);
}

// ============================================================================
// Stage Tests
// ============================================================================

#[test]
fn test_partition_and_compress_preserve_bytes() {
    let dir = TempDir::new().unwrap();
    let csv = dir.path().join("events.csv");
    let mut data = Vec::new();
    for i in 0..50 {
        data.extend_from_slice(format!("\"{i}\"|\"line one\nline two\"|\"x\"\"y\"\n").as_bytes());
    }
    std::fs::write(&csv, &data).unwrap();
    let artifact = Artifact::from_path("events", ArtifactStage::Raw, &csv).unwrap();

    let chunks = partition(&artifact, 256).unwrap();
    let archives = compress_all(&chunks, &dir.path().join("gzip")).unwrap();

    assert!(chunks.len() > 1);
    assert!(chunks.iter().all(|c| c.size <= 256));
    let mut restored = Vec::new();
    for archive in &archives {
        let bytes = decompress(&archive.path).unwrap();
        // Every chunk holds whole records
        assert!(bytes.ends_with(b"\"x\"\"y\"\n"));
        restored.extend(bytes);
    }
    assert_eq!(restored, data);
}

#[tokio::test]
async fn test_upload_directory_skips_existing_objects() {
    let dir = TempDir::new().unwrap();
    let files = dir.path().join("gzip");
    std::fs::create_dir_all(&files).unwrap();
    for name in ["a.csv.gz", "b.csv.gz", "c.csv.gz"] {
        std::fs::write(files.join(name), name.as_bytes()).unwrap();
    }
    let storage = Arc::new(LocalStorage::filesystem(dir.path().join("objects")).unwrap());
    let uploader = Uploader::new(
        storage.clone(),
        RetryPolicy::no_retry(),
        UploadConfig::default(),
        "local",
    );

    uploader.ensure_bucket("bucket").await.unwrap();
    let first = uploader
        .upload_directory("bucket", "events/", &files)
        .await
        .unwrap();
    std::fs::write(files.join("a.csv.gz"), b"changed").unwrap();
    let second = uploader
        .upload_directory("bucket", "events/", &files)
        .await
        .unwrap();

    assert_eq!(first.uploaded(), 3);
    assert_eq!(second.skipped(), 3);
    assert_eq!(first.uris(), second.uris());
    assert!(storage.exists("bucket", "events/a.csv.gz").await.unwrap());
    assert_eq!(
        std::fs::read(dir.path().join("objects/bucket/events/a.csv.gz")).unwrap(),
        b"a.csv.gz"
    );
}

// ============================================================================
// CLI Tests
// ============================================================================

#[test]
fn test_cli_validate() {
    let dir = TempDir::new().unwrap();
    let pipeline_file = write_pipeline(
        dir.path(),
        &dir.path().join("s.db"),
        &dir.path().join("w.db"),
        "",
    );

    let output = Command::new(env!("CARGO_BIN_EXE_chariot"))
        .args(["validate", "-p"])
        .arg(&pipeline_file)
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("is valid with 1 jobs"), "{stdout}");
}

#[test]
fn test_cli_run_fails_on_missing_pipeline() {
    let dir = TempDir::new().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_chariot"))
        .args(["run", "--chain", "7", "-p"])
        .arg(dir.path().join("missing.yaml"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).starts_with("Error:"));
}
