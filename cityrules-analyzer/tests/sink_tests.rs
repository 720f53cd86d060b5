//! Task source → scheduler → sink, end to end with a stub service

mod helpers;

use cityrules_analyzer::config::PipelineConfig;
use cityrules_analyzer::db;
use cityrules_analyzer::models::TaskOutcome;
use cityrules_analyzer::services::result_sink::{JsonFileSink, SqliteSink};
use cityrules_analyzer::services::task_source::TaskSource;
use cityrules_analyzer::Scheduler;
use cityrules_common::events::RunSummary;
use helpers::{Reply, StubService};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn markdown_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("ch01_general.md"), "# General\nApplies citywide.").unwrap();
    fs::write(dir.path().join("ch02_setbacks.md"), "# Setbacks\nFront: 20 ft").unwrap();
    fs::write(dir.path().join("ch03_height.md"), "# Height\nMax 35 ft").unwrap();
    dir
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.concurrency = 2;
    config.retry.base_delay = Duration::from_millis(10);
    config
}

#[tokio::test]
async fn test_sqlite_sink_upserts_requeued_task() {
    let input = markdown_dir();
    let output = TempDir::new().unwrap();
    let source = TaskSource::scan_markdown(input.path(), "Extract rules:\n{content}").unwrap();

    let service = Arc::new(
        StubService::new(Duration::from_millis(10))
            .with_script("ch02_setbacks", vec![Reply::Fatal(400), Reply::json()]),
    );
    let run_id = Uuid::new_v4();
    let sink = Arc::new(SqliteSink::open(output.path(), run_id).await.unwrap());
    let mut config = config();
    config.retry_failed_pass = true;

    let report = Scheduler::new(service, sink.clone(), config)
        .with_run_id(run_id)
        .run(source)
        .await
        .unwrap();
    assert_eq!(report.summary.run_id, run_id);
    assert_eq!(report.summary.succeeded, 3);

    let rows = db::load_outcome_rows(sink.pool(), run_id).await.unwrap();
    assert_eq!(rows.len(), 3);
    let setbacks = rows.iter().find(|r| r.0 == "ch02_setbacks").unwrap();
    assert!(setbacks.1);
    assert_eq!(setbacks.2, "parsed");

    let recorded: (i64, i64) =
        sqlx::query_as("SELECT total, succeeded FROM pipeline_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_one(sink.pool())
            .await
            .unwrap();
    assert_eq!(recorded, (3, 3));

    let calls: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM interactions WHERE run_id = ?")
        .bind(run_id.to_string())
        .fetch_one(sink.pool())
        .await
        .unwrap();
    assert_eq!(calls, 4);
}

#[tokio::test]
async fn test_json_sink_writes_one_file_per_task() {
    let input = markdown_dir();
    let output = TempDir::new().unwrap();
    let source = TaskSource::scan_markdown(input.path(), "Extract rules").unwrap();

    let service = Arc::new(
        StubService::new(Duration::from_millis(10))
            .with_script("ch03_height", vec![Reply::Fatal(403)]),
    );
    let sink = Arc::new(JsonFileSink::create(output.path(), "markdown_analysis").unwrap());

    let report = Scheduler::new(service, sink.clone(), config())
        .run(source)
        .await
        .unwrap();
    assert_eq!(report.summary.failed_task_ids, vec!["ch03_height".to_string()]);

    for id in ["ch01_general", "ch02_setbacks", "ch03_height"] {
        let written: TaskOutcome =
            serde_json::from_slice(&fs::read(sink.result_path(id)).unwrap()).unwrap();
        assert_eq!(&written, report.outcome(id).unwrap());
    }

    let summary: RunSummary = serde_json::from_slice(
        &fs::read(sink.run_dir().join("run_summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.planned, 3);
}
