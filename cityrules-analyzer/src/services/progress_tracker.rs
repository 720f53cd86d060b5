//! Progress tracking
//!
//! All counters live in one [`PipelineStats`] behind a single mutex, so a
//! [`ProgressSnapshot`] always describes one consistent moment. Critical
//! sections only touch counters; no I/O happens under the lock.
//!
//! Used for reporting only, never for scheduling decisions.

use crate::models::{RawResult, TaskOutcome};
use cityrules_common::events::ProgressSnapshot;
use indexmap::IndexSet;
use std::sync::{Mutex, PoisonError};
use tokio::time::Instant;

/// Mutable run counters
#[derive(Debug, Clone)]
pub struct PipelineStats {
    /// Outcomes recorded; never decremented
    pub completed_count: usize,
    /// Failed task ids, in the order they failed
    pub failed_task_ids: IndexSet<String>,
    pub started_at: Instant,
    /// Service calls sent
    pub message_count: u64,
    /// Service calls with attempt number > 1
    pub retry_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            completed_count: 0,
            failed_task_ids: IndexSet::new(),
            started_at: Instant::now(),
            message_count: 0,
            retry_count: 0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    fn snapshot(&self, total: usize) -> ProgressSnapshot {
        let elapsed_secs = self.started_at.elapsed().as_secs_f64();
        let rate_per_sec = if elapsed_secs > 0.0 && self.completed_count > 0 {
            self.completed_count as f64 / elapsed_secs
        } else {
            0.0
        };
        let eta_secs = if rate_per_sec > 0.0 {
            Some(total.saturating_sub(self.completed_count) as f64 / rate_per_sec)
        } else {
            None
        };

        ProgressSnapshot {
            completed: self.completed_count,
            total,
            failed: self.failed_task_ids.len(),
            elapsed_secs,
            rate_per_sec,
            eta_secs,
        }
    }
}

/// Thread-safe progress counters for one run
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    stats: Mutex<PipelineStats>,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            stats: Mutex::new(PipelineStats::new()),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Record a task's first outcome
    pub fn record(&self, outcome: &TaskOutcome) -> ProgressSnapshot {
        let mut stats = self.lock();
        stats.completed_count += 1;
        if !outcome.success {
            stats.failed_task_ids.insert(outcome.task_id.clone());
        }
        stats.snapshot(self.total)
    }

    /// Record the outcome of a requeued task
    ///
    /// The task was already counted as completed; only its failed status
    /// can change.
    pub fn record_requeued(&self, outcome: &TaskOutcome) -> ProgressSnapshot {
        let mut stats = self.lock();
        if outcome.success {
            stats.failed_task_ids.shift_remove(&outcome.task_id);
        } else {
            stats.failed_task_ids.insert(outcome.task_id.clone());
        }
        stats.snapshot(self.total)
    }

    /// Count one service call and its token usage
    pub fn record_attempt(&self, raw: &RawResult) {
        let mut stats = self.lock();
        stats.message_count += 1;
        if raw.attempt.number > 1 {
            stats.retry_count += 1;
        }
        if let Some(usage) = raw.usage {
            stats.input_tokens += usage.input_tokens;
            stats.output_tokens += usage.output_tokens;
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot(self.total)
    }

    /// Copy of the raw counters
    pub fn stats(&self) -> PipelineStats {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PipelineStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
