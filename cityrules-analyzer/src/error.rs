//! Error types for cityrules-analyzer
//!
//! Only pipeline-wide conditions are errors. A single task's failure is
//! data: it becomes a `TaskOutcome` with `success = false`.

use std::path::PathBuf;
use thiserror::Error;

/// Pipeline-wide error surfaced to the caller of the scheduler
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Nothing to process
    #[error("Task source is empty")]
    EmptyTaskSource,

    /// Run parameters that cannot drive a scheduler (zero concurrency etc.)
    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

/// Task-source scanning errors
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Input directory not found: {0}")]
    NotFound(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result sink errors
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for pipeline entry points
pub type PipelineResult<T> = Result<T, PipelineError>;
