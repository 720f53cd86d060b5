//! SQLite storage for task outcomes and run summaries
//!
//! Tables:
//! - `task_outcomes`: one row per (run, task), upserted on requeue
//! - `pipeline_runs`: one row per finished run
//! - `interactions`: one row per service call

use crate::error::SinkError;
use crate::models::TaskOutcome;
use crate::services::interaction_log::InteractionRecord;
use cityrules_common::events::RunSummary;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

/// Open (creating if needed) the database and its tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool, SinkError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

async fn init_tables(pool: &SqlitePool) -> Result<(), SinkError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_outcomes (
            run_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            success INTEGER NOT NULL,
            result_kind TEXT NOT NULL,
            result_json TEXT NOT NULL,
            attempts_used INTEGER NOT NULL,
            completed_at TEXT NOT NULL,
            PRIMARY KEY (run_id, task_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_id TEXT PRIMARY KEY,
            total INTEGER NOT NULL,
            succeeded INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            salvaged INTEGER NOT NULL,
            cancelled INTEGER NOT NULL,
            elapsed_secs REAL NOT NULL,
            message_count INTEGER NOT NULL,
            retry_count INTEGER NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            summary_json TEXT NOT NULL,
            finished_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS interactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            status TEXT NOT NULL,
            http_status INTEGER,
            response_time_ms INTEGER NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            content_length INTEGER NOT NULL,
            error TEXT,
            timestamp TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::debug!("Database tables initialized (task_outcomes, pipeline_runs, interactions)");
    Ok(())
}

fn result_kind(outcome: &TaskOutcome) -> &'static str {
    match outcome.result {
        crate::models::StructuredResult::Parsed { .. } => "parsed",
        crate::models::StructuredResult::Salvaged { .. } => "salvaged",
        crate::models::StructuredResult::Failed { .. } => "failed",
    }
}

/// Insert or replace a task's outcome within a run
pub async fn upsert_outcome(
    pool: &SqlitePool,
    run_id: Uuid,
    outcome: &TaskOutcome,
) -> Result<(), SinkError> {
    let result_json = serde_json::to_string(&outcome.result)?;

    sqlx::query(
        r#"
        INSERT INTO task_outcomes
            (run_id, task_id, success, result_kind, result_json, attempts_used, completed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(run_id, task_id) DO UPDATE SET
            success = excluded.success,
            result_kind = excluded.result_kind,
            result_json = excluded.result_json,
            attempts_used = excluded.attempts_used,
            completed_at = excluded.completed_at
        "#,
    )
    .bind(run_id.to_string())
    .bind(&outcome.task_id)
    .bind(outcome.success)
    .bind(result_kind(outcome))
    .bind(&result_json)
    .bind(outcome.attempts_used as i64)
    .bind(outcome.completed_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a finished run and its interaction log
pub async fn insert_run(
    pool: &SqlitePool,
    summary: &RunSummary,
    interactions: &[InteractionRecord],
) -> Result<(), SinkError> {
    let summary_json = serde_json::to_string(summary)?;
    let run_id = summary.run_id.to_string();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO pipeline_runs
            (run_id, total, succeeded, failed, salvaged, cancelled, elapsed_secs,
             message_count, retry_count, input_tokens, output_tokens, summary_json, finished_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&run_id)
    .bind(summary.total as i64)
    .bind(summary.succeeded as i64)
    .bind(summary.failed as i64)
    .bind(summary.salvaged as i64)
    .bind(summary.cancelled)
    .bind(summary.elapsed_secs)
    .bind(summary.message_count as i64)
    .bind(summary.retry_count as i64)
    .bind(summary.input_tokens as i64)
    .bind(summary.output_tokens as i64)
    .bind(&summary_json)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(&mut *tx)
    .await?;

    for record in interactions {
        sqlx::query(
            r#"
            INSERT INTO interactions
                (run_id, task_id, attempt, status, http_status, response_time_ms,
                 input_tokens, output_tokens, content_length, error, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run_id)
        .bind(&record.task_id)
        .bind(record.attempt as i64)
        .bind(&record.status)
        .bind(record.http_status.map(i64::from))
        .bind(record.response_time_ms as i64)
        .bind(record.input_tokens as i64)
        .bind(record.output_tokens as i64)
        .bind(record.content_length as i64)
        .bind(&record.error)
        .bind(record.timestamp.to_rfc3339())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Stored outcome row: (task_id, success, result_kind, attempts_used)
pub async fn load_outcome_rows(
    pool: &SqlitePool,
    run_id: Uuid,
) -> Result<Vec<(String, bool, String, i64)>, SinkError> {
    let rows = sqlx::query(
        "SELECT task_id, success, result_kind, attempts_used FROM task_outcomes WHERE run_id = ? ORDER BY task_id",
    )
    .bind(run_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            (
                row.get::<String, _>("task_id"),
                row.get::<bool, _>("success"),
                row.get::<String, _>("result_kind"),
                row.get::<i64, _>("attempts_used"),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StructuredResult;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upsert_replaces_previous_outcome() {
        let dir = TempDir::new().unwrap();
        let pool = init_database_pool(&dir.path().join("runs").join("cityrules.db"))
            .await
            .unwrap();
        let run_id = Uuid::new_v4();

        let failed = TaskOutcome::new("page_002", StructuredResult::failed("timeout", ""), 3);
        upsert_outcome(&pool, run_id, &failed).await.unwrap();

        let retried = TaskOutcome::new(
            "page_002",
            StructuredResult::Parsed { value: json!({"ok": true}) },
            1,
        );
        upsert_outcome(&pool, run_id, &retried).await.unwrap();

        let rows = load_outcome_rows(&pool, run_id).await.unwrap();
        assert_eq!(rows, vec![("page_002".to_string(), true, "parsed".to_string(), 1)]);
    }
}
