//! Tests for the pipeline orchestrator

use super::*;
use crate::compress::decompress;
use crate::config::load_pipeline_from_str;
use crate::database::DuckDbEngine;
use crate::storage::LocalStorage;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const ORDERS_JOB: &str = r#"
  - table: orders
    query_kind: replace
    export_query: "SELECT * FROM orders WHERE chain_id = {{ chain_id }} ORDER BY id"
    merge_query: "DELETE FROM orders WHERE chain_id = {{ chain_id }}; INSERT INTO orders SELECT * FROM {{ staging_table }};"
"#;

const BROKEN_JOB: &str = r#"
  - table: broken
    export_query: "SELECT * FROM no_such_table"
    merge_query: "SELECT 1"
"#;

struct Fixture {
    dir: TempDir,
    source: DuckDbEngine,
    warehouse: DuckDbEngine,
}

impl Fixture {
    fn new() -> Self {
        let source = DuckDbEngine::open(":memory:").unwrap();
        source
            .connection()
            .execute_batch(
                "CREATE TABLE orders (chain_id INTEGER, id INTEGER, note VARCHAR);
                 INSERT INTO orders VALUES (7, 1, 'a'), (7, 2, 'b'), (7, 3, 'c'), (8, 1, 'other');",
            )
            .unwrap();

        let warehouse = DuckDbEngine::open(":memory:").unwrap();
        warehouse
            .connection()
            .execute_batch(
                "CREATE TABLE orders (chain_id INTEGER, id INTEGER, note VARCHAR);
                 CREATE TABLE broken (x INTEGER);",
            )
            .unwrap();

        Self {
            dir: tempfile::tempdir().unwrap(),
            source,
            warehouse,
        }
    }

    fn work_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("work")
    }

    fn yaml(&self, extra: &str, jobs: &str) -> String {
        format!(
            r#"
work_dir: "{work}"
source:
  type: duckdb
  path: ":memory:"
warehouse:
  type: duckdb
  path: ":memory:"
storage:
  type: local
  root: "{objects}"
upload:
  initial_backoff_ms: 1
  max_backoff_ms: 1
logging:
  file: null
{extra}
jobs:
{jobs}
"#,
            work = self.work_dir().display(),
            objects = self.dir.path().join("objects").display(),
        )
    }

    fn pipeline(&self, extra: &str, jobs: &str) -> Pipeline {
        let config = load_pipeline_from_str(&self.yaml(extra, jobs)).unwrap();
        let storage = LocalStorage::filesystem(self.dir.path().join("objects")).unwrap();
        Pipeline::new(
            config,
            Box::new(self.source.try_clone().unwrap()),
            Arc::new(storage),
            Box::new(self.warehouse.try_clone().unwrap()),
        )
    }

    fn target_rows(&self) -> Vec<(i32, String)> {
        let conn = self.warehouse.connection();
        let mut stmt = conn
            .prepare("SELECT id, note FROM orders WHERE chain_id = 7 ORDER BY id")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }
}

fn chain() -> ChainId {
    ChainId::new("7").unwrap()
}

fn stages(report: &RunReport) -> Vec<(&str, TableStage)> {
    report
        .tables
        .iter()
        .map(|t| (t.table.as_str(), t.stage))
        .collect()
}

// ============================================================================
// End-to-End Tests
// ============================================================================

#[tokio::test]
async fn test_replace_rows_for_chain() {
    let fixture = Fixture::new();
    let mut pipeline = fixture.pipeline("", ORDERS_JOB);

    let report = pipeline.run(&chain(), &RunOptions::default()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.bucket, "chain-7");
    let table = &report.tables[0];
    assert_eq!(table.stage, TableStage::Done);
    assert_eq!(table.chunks, 1);
    assert_eq!(table.objects_uploaded, 1);
    assert_eq!(table.rows_copied, 3);
    assert_eq!(
        fixture.target_rows(),
        vec![
            (1, "a".to_string()),
            (2, "b".to_string()),
            (3, "c".to_string())
        ]
    );

    // Second run with one changed row: updated, no duplicates
    fixture
        .source
        .connection()
        .execute_batch("UPDATE orders SET note = 'b2' WHERE chain_id = 7 AND id = 2")
        .unwrap();
    let report = pipeline.run(&chain(), &RunOptions::default()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.tables[0].objects_uploaded, 1);
    assert_eq!(
        fixture.target_rows(),
        vec![
            (1, "a".to_string()),
            (2, "b2".to_string()),
            (3, "c".to_string())
        ]
    );
}

#[tokio::test]
async fn test_large_export_is_split() {
    let fixture = Fixture::new();
    fixture
        .source
        .connection()
        .execute_batch(
            "CREATE TABLE codes AS SELECT lpad(i::VARCHAR, 8, '0') AS code FROM range(9) t(i);",
        )
        .unwrap();
    fixture
        .warehouse
        .connection()
        .execute_batch("CREATE TABLE codes (code VARCHAR);")
        .unwrap();
    // Every record is `"0000000N"\n`, 11 bytes: 99 bytes = 2.25 x 44
    let job = r#"
  - table: codes
    export_query: "SELECT code FROM codes ORDER BY code"
    merge_query: "INSERT INTO codes SELECT * FROM {{ staging_table }}"
"#;
    let mut pipeline = fixture.pipeline(
        "keep_artifacts: true\npartition:\n  chunk_size_bytes: 44",
        job,
    );

    let report = pipeline.run(&chain(), &RunOptions::default()).await.unwrap();

    let table = &report.tables[0];
    assert!(table.is_success(), "{:?}", table.error);
    assert_eq!(table.bytes_exported, 99);
    assert_eq!(table.chunks, 3);
    assert_eq!(table.objects_uploaded, 3);
    assert_eq!(table.rows_copied, 9);

    let gzip_dir = fixture.work_dir().join("gzip").join("7");
    let mut archives: Vec<_> = std::fs::read_dir(&gzip_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    archives.sort();
    let sizes: Vec<usize> = archives
        .iter()
        .map(|path| decompress(path).unwrap().len())
        .collect();
    assert_eq!(sizes, vec![44, 44, 11]);
}

#[tokio::test]
async fn test_working_directories_removed() {
    let fixture = Fixture::new();
    let mut pipeline = fixture.pipeline("", ORDERS_JOB);

    pipeline.run(&chain(), &RunOptions::default()).await.unwrap();

    assert!(!fixture.work_dir().join("csv").join("7").exists());
    assert!(!fixture.work_dir().join("gzip").join("7").exists());
}

#[tokio::test]
async fn test_bucket_purged_between_runs() {
    let fixture = Fixture::new();
    let stale = fixture
        .dir
        .path()
        .join("objects")
        .join("chain-7")
        .join("old_table");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("stale.csv.gz"), b"x").unwrap();
    let mut pipeline = fixture.pipeline("", ORDERS_JOB);

    pipeline.run(&chain(), &RunOptions::default()).await.unwrap();

    assert!(!stale.join("stale.csv.gz").exists());
}

// ============================================================================
// Run Mode Tests
// ============================================================================

#[tokio::test]
async fn test_mode_all_continues_past_failure() {
    let fixture = Fixture::new();
    let mut pipeline = fixture.pipeline("", &format!("{BROKEN_JOB}{ORDERS_JOB}"));

    let report = pipeline.run(&chain(), &RunOptions::default()).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(
        stages(&report),
        vec![
            ("broken", TableStage::Failed { at: Step::Export }),
            ("orders", TableStage::Done)
        ]
    );
    let error = report.tables[0].error.as_deref().unwrap();
    assert!(error.starts_with("Table 'broken' failed at export"));
    assert_eq!(fixture.target_rows().len(), 3);
}

#[tokio::test]
async fn test_mode_fail_fast_stops() {
    let fixture = Fixture::new();
    let mut pipeline = fixture.pipeline("mode: fail_fast", &format!("{BROKEN_JOB}{ORDERS_JOB}"));

    let report = pipeline.run(&chain(), &RunOptions::default()).await.unwrap();

    assert_eq!(
        stages(&report),
        vec![("broken", TableStage::Failed { at: Step::Export })]
    );
    assert!(fixture.target_rows().is_empty());
}

#[tokio::test]
async fn test_mode_first_table_override() {
    let fixture = Fixture::new();
    let mut pipeline = fixture.pipeline("", &format!("{ORDERS_JOB}{BROKEN_JOB}"));
    let options = RunOptions {
        mode: Some(RunMode::FirstTable),
        ..RunOptions::default()
    };

    let report = pipeline.run(&chain(), &options).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.mode, RunMode::FirstTable);
    assert_eq!(stages(&report), vec![("orders", TableStage::Done)]);
}

#[tokio::test]
async fn test_table_filter() {
    let fixture = Fixture::new();
    let mut pipeline = fixture.pipeline("", &format!("{BROKEN_JOB}{ORDERS_JOB}"));
    let options = RunOptions {
        tables: vec!["orders".to_string()],
        ..RunOptions::default()
    };

    let report = pipeline.run(&chain(), &options).await.unwrap();

    assert_eq!(stages(&report), vec![("orders", TableStage::Done)]);
}

#[tokio::test]
async fn test_unknown_table_filter() {
    let fixture = Fixture::new();
    let mut pipeline = fixture.pipeline("", ORDERS_JOB);
    let options = RunOptions {
        tables: vec!["customers".to_string()],
        ..RunOptions::default()
    };

    let err = pipeline.run(&chain(), &options).await.unwrap_err();

    assert_eq!(err.kind(), crate::error::ErrorKind::Config);
}

// ============================================================================
// Failure Stage Tests
// ============================================================================

#[tokio::test]
async fn test_failed_merge_leaves_target_untouched() {
    let fixture = Fixture::new();
    fixture
        .warehouse
        .connection()
        .execute_batch("INSERT INTO orders VALUES (7, 1, 'kept')")
        .unwrap();
    let job = r#"
  - table: orders
    export_query: "SELECT * FROM orders WHERE chain_id = {{ chain_id }}"
    merge_query: "DELETE FROM orders; INSERT INTO missing SELECT * FROM {{ staging_table }};"
"#;
    let mut pipeline = fixture.pipeline("", job);

    let report = pipeline.run(&chain(), &RunOptions::default()).await.unwrap();

    assert_eq!(
        report.tables[0].stage,
        TableStage::Failed { at: Step::Load }
    );
    assert_eq!(fixture.target_rows(), vec![(1, "kept".to_string())]);
}

#[tokio::test]
async fn test_render_failure() {
    let fixture = Fixture::new();
    let job = r#"
  - table: orders
    export_query: "SELECT * FROM orders WHERE note = '{{ env.CHARIOT_TEST_SURELY_UNSET }}'"
    merge_query: "SELECT 1"
"#;
    let mut pipeline = fixture.pipeline("", job);

    let report = pipeline.run(&chain(), &RunOptions::default()).await.unwrap();

    assert_eq!(
        report.tables[0].stage,
        TableStage::Failed { at: Step::Render }
    );
}

#[test]
fn test_select_jobs_keeps_order() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline("", &format!("{ORDERS_JOB}{BROKEN_JOB}"));

    let jobs = pipeline.select_jobs(&RunOptions::default()).unwrap();

    let names: Vec<&str> = jobs.iter().map(|j| j.table.as_str()).collect();
    assert_eq!(names, vec!["orders", "broken"]);
}
