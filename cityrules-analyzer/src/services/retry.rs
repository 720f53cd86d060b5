//! Retry and backoff for a single task
//!
//! [`run_task`] drives the generation service for one task until it yields
//! an outcome:
//! 1. Call the service
//! 2. `Ok` → sanitize; a total sanitize failure is resampled once if
//!    `sanitizer_retry` is enabled, otherwise it is the outcome
//! 3. `Fatal` → failed outcome, no further calls
//! 4. `Transient` → retry while attempts remain:
//!    - the first empty response retries immediately
//!    - everything else waits `base_delay * 2^(n-1)` after failed attempt `n`
//!
//! Every service call counts towards `max_attempts`. Exhaustion produces a
//! failed outcome; nothing here ever returns an error.

use crate::models::{Attempt, RawResult, RawStatus, StructuredResult, Task, TaskOutcome, TransientKind};
use crate::services::generation_client::GenerationService;
use crate::services::sanitizer::sanitize;
use std::collections::HashSet;
use std::time::Duration;

/// Exponent cap so large attempt counts cannot overflow the multiplier
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Retry configuration shared by every task in a run
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum service calls per task (>= 1)
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles each time
    pub base_delay: Duration,
    /// Retry the first empty response without waiting
    pub immediate_empty_retry: bool,
    /// Resample once when the sanitizer recovers nothing
    pub sanitizer_retry: bool,
    /// Transient kinds that are retried at all
    pub retryable: HashSet<TransientKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            immediate_empty_retry: true,
            sanitizer_retry: false,
            retryable: [
                TransientKind::Timeout,
                TransientKind::Connection,
                TransientKind::RetryableStatus,
                TransientKind::EmptyResponse,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// Delay applied after failed attempt `failed_attempt` (1-based)
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    pub fn is_retryable(&self, kind: TransientKind) -> bool {
        self.retryable.contains(&kind)
    }
}

/// Receives per-attempt notifications (stats, interaction log, events)
pub trait AttemptObserver: Send + Sync {
    /// Called once per service call, before the result is acted on
    fn on_attempt(&self, raw: &RawResult);

    /// Called when another attempt will follow after `delay`
    fn on_retry(&self, task_id: &str, failed_attempt: u32, reason: &str, delay: Duration);
}

/// Observer that ignores everything
pub struct NoopObserver;

impl AttemptObserver for NoopObserver {
    fn on_attempt(&self, _raw: &RawResult) {}

    fn on_retry(&self, _task_id: &str, _failed_attempt: u32, _reason: &str, _delay: Duration) {}
}

/// Run one task to completion under `policy`
pub async fn run_task(
    service: &dyn GenerationService,
    task: &Task,
    policy: &RetryPolicy,
    call_timeout: Duration,
    observer: &dyn AttemptObserver,
) -> TaskOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt_number = 0u32;
    let mut empty_retry_used = false;
    let mut sanitizer_retry_used = false;

    loop {
        attempt_number += 1;
        let raw = service
            .call(
                Attempt::new(task.id.clone(), attempt_number),
                &task.payload,
                call_timeout,
            )
            .await;
        observer.on_attempt(&raw);

        let kind = match raw.status {
            RawStatus::Ok => {
                let structured = sanitize(&raw.body);

                if structured.is_failed()
                    && policy.sanitizer_retry
                    && !sanitizer_retry_used
                    && attempt_number < max_attempts
                {
                    sanitizer_retry_used = true;
                    let reason = match &structured {
                        StructuredResult::Failed { reason, .. } => reason.clone(),
                        _ => String::new(),
                    };
                    tracing::warn!(
                        task_id = %task.id,
                        attempt = attempt_number,
                        reason = %reason,
                        "Unparseable response, resampling"
                    );
                    observer.on_retry(&task.id, attempt_number, &reason, Duration::ZERO);
                    continue;
                }

                if let StructuredResult::Salvaged { notes, .. } = &structured {
                    tracing::warn!(
                        task_id = %task.id,
                        attempt = attempt_number,
                        notes = ?notes,
                        "Response salvaged by repair heuristics"
                    );
                }
                return TaskOutcome::new(task.id.clone(), structured, attempt_number);
            }
            RawStatus::Fatal => {
                tracing::error!(
                    task_id = %task.id,
                    attempt = attempt_number,
                    reason = %raw.reason(),
                    "Non-retryable service error"
                );
                return failed_outcome(task, raw, attempt_number, None);
            }
            RawStatus::Transient(kind) => kind,
        };

        if !policy.is_retryable(kind) {
            return failed_outcome(task, raw, attempt_number, None);
        }

        if attempt_number >= max_attempts {
            tracing::error!(
                task_id = %task.id,
                attempts = attempt_number,
                reason = %raw.reason(),
                "Retries exhausted"
            );
            return failed_outcome(task, raw, attempt_number, Some(max_attempts));
        }

        let reason = raw.reason();
        if kind == TransientKind::EmptyResponse && policy.immediate_empty_retry && !empty_retry_used {
            empty_retry_used = true;
            tracing::warn!(
                task_id = %task.id,
                attempt = attempt_number,
                "Empty response, retrying immediately"
            );
            observer.on_retry(&task.id, attempt_number, &reason, Duration::ZERO);
            continue;
        }

        let delay = policy.backoff(attempt_number);
        tracing::warn!(
            task_id = %task.id,
            attempt = attempt_number,
            reason = %reason,
            backoff_ms = delay.as_millis() as u64,
            "Attempt failed, will retry after backoff"
        );
        observer.on_retry(&task.id, attempt_number, &reason, delay);
        tokio::time::sleep(delay).await;
    }
}

fn failed_outcome(
    task: &Task,
    raw: RawResult,
    attempts_used: u32,
    exhausted_after: Option<u32>,
) -> TaskOutcome {
    let reason = match exhausted_after {
        Some(max) => format!("{} (gave up after {} attempts)", raw.reason(), max),
        None => raw.reason(),
    };
    TaskOutcome::new(
        task.id.clone(),
        StructuredResult::failed(reason, raw.body),
        attempts_used,
    )
}
