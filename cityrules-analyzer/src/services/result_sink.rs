//! Result sinks
//!
//! The scheduler hands every outcome to a [`ResultSink`] exactly once (again
//! for a requeued task). Sink writes happen outside any lock; a failed write
//! is reported back to the scheduler and never changes the task's success.

use crate::db;
use crate::error::SinkError;
use crate::models::TaskOutcome;
use crate::services::interaction_log::InteractionRecord;
use async_trait::async_trait;
use cityrules_common::events::RunSummary;
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Database file name created inside the output root
pub const SQLITE_FILE_NAME: &str = "cityrules.db";

/// Persists task outcomes
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist one outcome; a later call for the same task id replaces it
    async fn persist(&self, outcome: &TaskOutcome) -> Result<(), SinkError>;

    /// Called once after the last outcome
    async fn finish(
        &self,
        summary: &RunSummary,
        interactions: &[InteractionRecord],
    ) -> Result<(), SinkError>;

    /// Where results end up, for the final summary
    fn location(&self) -> String;
}

/// One pretty-printed JSON file per task in a timestamped run directory
///
/// Layout:
/// ```text
/// {root}/{prefix}_{YYYYmmdd_HHMMSS}/
///     {task_id}_result.json
///     run_summary.json
///     interaction_log.json
/// ```
pub struct JsonFileSink {
    run_dir: PathBuf,
}

impl JsonFileSink {
    /// Create a fresh run directory under `root`
    pub fn create(root: &Path, prefix: &str) -> Result<Self, SinkError> {
        std::fs::create_dir_all(root)?;

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let base = format!("{}_{}", prefix, stamp);
        let mut run_dir = root.join(&base);
        let mut suffix = 2;
        while run_dir.exists() {
            run_dir = root.join(format!("{}_{}", base, suffix));
            suffix += 1;
        }
        std::fs::create_dir(&run_dir)?;

        tracing::info!(run_dir = %run_dir.display(), "Created run directory");
        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// File holding the outcome for `task_id`
    pub fn result_path(&self, task_id: &str) -> PathBuf {
        self.run_dir
            .join(format!("{}_result.json", file_safe(task_id)))
    }

    async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), SinkError> {
        let content = serde_json::to_vec_pretty(value)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    async fn persist(&self, outcome: &TaskOutcome) -> Result<(), SinkError> {
        let path = self.result_path(&outcome.task_id);
        self.write_json(&path, outcome).await
    }

    async fn finish(
        &self,
        summary: &RunSummary,
        interactions: &[InteractionRecord],
    ) -> Result<(), SinkError> {
        self.write_json(&self.run_dir.join("run_summary.json"), summary)
            .await?;
        self.write_json(&self.run_dir.join("interaction_log.json"), interactions)
            .await?;
        Ok(())
    }

    fn location(&self) -> String {
        self.run_dir.display().to_string()
    }
}

/// Rows in a SQLite database (`task_outcomes`, `pipeline_runs`, `interactions`)
pub struct SqliteSink {
    pool: SqlitePool,
    run_id: Uuid,
    db_path: PathBuf,
}

impl SqliteSink {
    /// Open `{root}/cityrules.db`, creating tables if missing
    pub async fn open(root: &Path, run_id: Uuid) -> Result<Self, SinkError> {
        let db_path = root.join(SQLITE_FILE_NAME);
        let pool = db::init_database_pool(&db_path).await?;
        tracing::info!(db = %db_path.display(), %run_id, "Opened result database");
        Ok(Self {
            pool,
            run_id,
            db_path,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

#[async_trait]
impl ResultSink for SqliteSink {
    async fn persist(&self, outcome: &TaskOutcome) -> Result<(), SinkError> {
        db::upsert_outcome(&self.pool, self.run_id, outcome).await
    }

    async fn finish(
        &self,
        summary: &RunSummary,
        interactions: &[InteractionRecord],
    ) -> Result<(), SinkError> {
        db::insert_run(&self.pool, summary, interactions).await
    }

    fn location(&self) -> String {
        format!("{} (run {})", self.db_path.display(), self.run_id)
    }
}

/// Replace characters that are unsafe in file names
fn file_safe(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "task".to_string()
    } else {
        cleaned
    }
}
