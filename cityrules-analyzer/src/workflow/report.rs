//! Run report and final summary

use crate::models::TaskOutcome;
use crate::services::progress_tracker::PipelineStats;
use cityrules_common::events::RunSummary;
use cityrules_common::human_time::format_duration;
use std::fmt::Write as _;
use uuid::Uuid;

/// Everything a finished (or cancelled) run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    /// One outcome per attempted task, in completion order
    pub outcomes: Vec<TaskOutcome>,
}

impl RunReport {
    pub fn outcome(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.task_id == task_id)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.iter().filter(|o| o.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }
}

/// Input for [`build_summary`] beyond the outcomes themselves
pub struct SummaryParts<'a> {
    pub run_id: Uuid,
    pub planned: usize,
    pub stats: &'a PipelineStats,
    pub sink_failures: Vec<String>,
    pub cancelled: bool,
}

pub fn build_summary(outcomes: &[TaskOutcome], parts: SummaryParts<'_>) -> RunSummary {
    let succeeded = outcomes.iter().filter(|o| o.success).count();
    let salvaged = outcomes
        .iter()
        .filter(|o| o.success && o.result.is_salvaged())
        .count();
    let failed_task_ids: Vec<String> = parts
        .stats
        .failed_task_ids
        .iter()
        .filter(|id| outcomes.iter().any(|o| &o.task_id == *id && !o.success))
        .cloned()
        .collect();

    RunSummary {
        run_id: parts.run_id,
        planned: parts.planned,
        total: outcomes.len(),
        succeeded,
        failed: outcomes.len() - succeeded,
        salvaged,
        failed_task_ids,
        sink_failures: parts.sink_failures,
        cancelled: parts.cancelled,
        elapsed_secs: parts.stats.started_at.elapsed().as_secs_f64(),
        message_count: parts.stats.message_count,
        retry_count: parts.stats.retry_count,
        input_tokens: parts.stats.input_tokens,
        output_tokens: parts.stats.output_tokens,
    }
}

/// Human-readable final summary
pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "=".repeat(60));
    if summary.cancelled {
        let _ = writeln!(
            out,
            "RUN CANCELLED: {} of {} tasks attempted",
            summary.total, summary.planned
        );
    } else {
        let _ = writeln!(out, "RUN COMPLETE");
    }
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out, "Attempted:  {}", summary.total);
    let _ = writeln!(
        out,
        "Succeeded:  {} ({:.1}%)",
        summary.succeeded,
        summary.success_percent()
    );
    if summary.salvaged > 0 {
        let _ = writeln!(out, "  salvaged: {} (repaired output, lower confidence)", summary.salvaged);
    }
    let _ = writeln!(out, "Failed:     {}", summary.failed);
    for id in &summary.failed_task_ids {
        let _ = writeln!(out, "  - {}", id);
    }
    let _ = writeln!(
        out,
        "Elapsed:    {} ({:.2} tasks/s)",
        format_duration(summary.elapsed_secs),
        summary.rate_per_sec()
    );
    let _ = writeln!(
        out,
        "Messages:   {} sent, {} retries",
        summary.message_count, summary.retry_count
    );
    let _ = writeln!(
        out,
        "Tokens:     {} in / {} out",
        summary.input_tokens, summary.output_tokens
    );
    if !summary.sink_failures.is_empty() {
        let _ = writeln!(out, "NOT PERSISTED: {}", summary.sink_failures.join(", "));
    }
    out
}
