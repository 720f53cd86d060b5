//! Bounded-concurrency scheduler
//!
//! Keeps exactly `min(N, remaining + in_flight)` tasks in flight: the first
//! `N` are seeded up front and every completion immediately submits the
//! next queued task. There is no batching, so one slow call never holds
//! back the others.
//!
//! Each task runs in its own spawned tokio task through
//! [`run_task`](crate::services::retry::run_task). A panic inside an attempt
//! surfaces as a `JoinError` and becomes a failed outcome; nothing a single
//! task does can end the run early.
//!
//! Sink writes run beside the in-flight set, polled by the same loop, so a
//! slow sink never holds a slot. An outcome is counted and announced only
//! after its write returns.
//!
//! Cancellation is cooperative: once the token fires no new task is
//! submitted. In-flight attempts finish (or time out) and their outcomes are
//! still persisted.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult, SinkError};
use crate::models::{RawResult, Task, TaskOutcome};
use crate::services::generation_client::GenerationService;
use crate::services::interaction_log::InteractionLog;
use crate::services::progress_tracker::ProgressTracker;
use crate::services::result_sink::ResultSink;
use crate::services::retry::{run_task, AttemptObserver, RetryPolicy};
use crate::services::task_source::TaskSource;
use crate::workflow::report::{build_summary, RunReport, SummaryParts};
use cityrules_common::events::{EventBus, PipelineEvent};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Concurrency cap for the failed-task pass
const REQUEUE_MAX_CONCURRENCY: usize = 4;

/// Current and peak number of tasks in flight
#[derive(Debug, Default)]
pub struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Feeds per-attempt data into the run's tracker, log and event bus
struct RunObserver {
    tracker: Arc<ProgressTracker>,
    log: Arc<InteractionLog>,
    events: EventBus,
}

impl AttemptObserver for RunObserver {
    fn on_attempt(&self, raw: &RawResult) {
        self.tracker.record_attempt(raw);
        self.log.record(raw);
    }

    fn on_retry(&self, task_id: &str, failed_attempt: u32, reason: &str, delay: Duration) {
        self.events.emit_lossy(PipelineEvent::AttemptFailed {
            task_id: task_id.to_string(),
            attempt: failed_attempt,
            reason: reason.to_string(),
            retry_in_ms: delay.as_millis() as u64,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Main,
    Requeue,
}

/// Mutable state of one pass over a task list
#[derive(Default)]
struct PassState {
    outcomes: Vec<TaskOutcome>,
    sink_failures: Vec<String>,
    /// Failed tasks kept for the requeue pass
    requeue: Vec<Task>,
    cancelled: bool,
}

/// Drives tasks through the generation service with bounded concurrency
pub struct Scheduler {
    service: Arc<dyn GenerationService>,
    sink: Arc<dyn ResultSink>,
    config: PipelineConfig,
    retry: Arc<RetryPolicy>,
    events: EventBus,
    cancel: CancellationToken,
    gauge: Arc<InFlightGauge>,
    run_id: Uuid,
}

impl Scheduler {
    pub fn new(
        service: Arc<dyn GenerationService>,
        sink: Arc<dyn ResultSink>,
        config: PipelineConfig,
    ) -> Self {
        let retry = Arc::new(config.retry.clone());
        Self {
            service,
            sink,
            config,
            retry,
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            gauge: Arc::new(InFlightGauge::default()),
            run_id: Uuid::new_v4(),
        }
    }

    /// Use a run id chosen by the caller (e.g. the one a sink was opened with)
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Publish events on an existing bus (e.g. one the CLI already listens to)
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Highest number of tasks simultaneously in flight so far
    pub fn in_flight_peak(&self) -> usize {
        self.gauge.peak()
    }

    pub fn in_flight(&self) -> usize {
        self.gauge.current()
    }

    /// Run every task in `source` and return the collected outcomes
    ///
    /// Only pipeline-wide conditions are errors: invalid configuration or
    /// an empty task source. Cancellation returns the partial report with
    /// `summary.cancelled = true`.
    pub async fn run(&self, source: TaskSource) -> PipelineResult<RunReport> {
        self.config.validate()?;
        if source.is_empty() {
            return Err(PipelineError::EmptyTaskSource);
        }

        let run_id = self.run_id;
        let tasks = source.into_tasks();
        let planned = tasks.len();

        let tracker = Arc::new(ProgressTracker::new(planned));
        let log = Arc::new(InteractionLog::new());
        let observer = Arc::new(RunObserver {
            tracker: Arc::clone(&tracker),
            log: Arc::clone(&log),
            events: self.events.clone(),
        });

        let concurrency = self.config.concurrency.min(planned);
        info!(
            %run_id,
            tasks = planned,
            concurrency,
            max_attempts = self.retry.max_attempts,
            "Starting pipeline run"
        );
        self.events.emit_lossy(PipelineEvent::RunStarted {
            run_id,
            total: planned,
            concurrency,
        });

        let mut state = PassState {
            outcomes: Vec::with_capacity(planned),
            ..PassState::default()
        };
        self.drive(tasks, concurrency, Pass::Main, &observer, &mut state)
            .await;

        if self.config.retry_failed_pass && !state.cancelled {
            self.requeue_failed(run_id, &observer, &mut state).await;
        }

        let stats = tracker.stats();
        let summary = build_summary(
            &state.outcomes,
            SummaryParts {
                run_id,
                planned,
                stats: &stats,
                sink_failures: state.sink_failures,
                cancelled: state.cancelled,
            },
        );

        if let Err(e) = self.sink.finish(&summary, &log.records()).await {
            error!(%run_id, error = %e, "Failed to write run summary");
        }

        info!(
            %run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            salvaged = summary.salvaged,
            cancelled = summary.cancelled,
            elapsed_ms = (summary.elapsed_secs * 1000.0) as u64,
            "Pipeline run finished"
        );
        self.events.emit_lossy(PipelineEvent::RunFinished {
            summary: summary.clone(),
        });

        Ok(RunReport {
            summary,
            outcomes: state.outcomes,
        })
    }

    /// Give every failed task one more attempt sequence
    ///
    /// New outcomes replace the old ones; completion counts stay unchanged.
    async fn requeue_failed(
        &self,
        run_id: Uuid,
        observer: &Arc<RunObserver>,
        state: &mut PassState,
    ) {
        let requeued = std::mem::take(&mut state.requeue);
        if requeued.is_empty() {
            return;
        }

        let concurrency = REQUEUE_MAX_CONCURRENCY
            .min(self.config.concurrency)
            .min(requeued.len());

        info!(%run_id, tasks = requeued.len(), concurrency, "Retrying failed tasks");
        self.events.emit_lossy(PipelineEvent::RetryPassStarted {
            run_id,
            tasks: requeued.len(),
        });

        let mut retry_state = PassState {
            outcomes: Vec::with_capacity(requeued.len()),
            ..PassState::default()
        };
        self.drive(requeued, concurrency, Pass::Requeue, observer, &mut retry_state)
            .await;

        for outcome in retry_state.outcomes {
            if let Some(slot) = state
                .outcomes
                .iter_mut()
                .find(|o| o.task_id == outcome.task_id)
            {
                *slot = outcome;
            }
        }
        for id in retry_state.sink_failures {
            if !state.sink_failures.contains(&id) {
                state.sink_failures.push(id);
            }
        }
        state.cancelled = retry_state.cancelled;
    }

    /// Seed `concurrency` tasks, then refill one per completion
    async fn drive(
        &self,
        tasks: Vec<Task>,
        concurrency: usize,
        pass: Pass,
        observer: &Arc<RunObserver>,
        state: &mut PassState,
    ) {
        let mut queue: VecDeque<Task> = tasks.into();
        let mut in_flight = FuturesUnordered::new();
        let mut persisting = FuturesUnordered::new();

        if self.cancel.is_cancelled() {
            warn!(pending = queue.len(), "Cancelled before start, nothing submitted");
            state.cancelled = true;
            return;
        }

        while in_flight.len() < concurrency {
            match queue.pop_front() {
                Some(task) => in_flight.push(self.submit(task, observer)),
                None => break,
            }
        }

        while !in_flight.is_empty() || !persisting.is_empty() {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !state.cancelled => {
                    state.cancelled = true;
                    warn!(
                        pending = queue.len(),
                        in_flight = in_flight.len(),
                        "Cancellation requested, draining in-flight attempts"
                    );
                    queue.clear();
                }

                Some((task, joined)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.gauge.exit();
                    if let Some(next) = queue.pop_front() {
                        in_flight.push(self.submit(next, observer));
                    }

                    let outcome = settle(&task.id, joined);
                    if pass == Pass::Main && !outcome.success && self.config.retry_failed_pass {
                        state.requeue.push(task);
                    }
                    persisting.push(self.persist(outcome));
                }

                Some((outcome, written)) = persisting.next(), if !persisting.is_empty() => {
                    self.complete(outcome, written, pass, observer, state);
                }
            }
        }
    }

    /// Spawn one task; resolves to the task and the join result
    fn submit(
        &self,
        task: Task,
        observer: &Arc<RunObserver>,
    ) -> impl Future<Output = (Task, Result<TaskOutcome, JoinError>)> {
        self.gauge.enter();

        let service = Arc::clone(&self.service);
        let retry = Arc::clone(&self.retry);
        let observer = Arc::clone(observer);
        let call_timeout = self.config.call_timeout;
        let spawned = task.clone();

        let handle = tokio::spawn(async move {
            run_task(
                service.as_ref(),
                &spawned,
                retry.as_ref(),
                call_timeout,
                observer.as_ref(),
            )
            .await
        });

        async move { (task, handle.await) }
    }

    /// Write one outcome; resolves to the outcome and the write result
    fn persist(
        &self,
        outcome: TaskOutcome,
    ) -> impl Future<Output = (TaskOutcome, Result<(), SinkError>)> {
        let sink = Arc::clone(&self.sink);
        async move {
            let written = sink.persist(&outcome).await;
            (outcome, written)
        }
    }

    /// Count and announce one persisted outcome
    fn complete(
        &self,
        outcome: TaskOutcome,
        written: Result<(), SinkError>,
        pass: Pass,
        observer: &RunObserver,
        state: &mut PassState,
    ) {
        if let Err(e) = written {
            error!(task_id = %outcome.task_id, error = %e, "Failed to persist outcome");
            if !state.sink_failures.contains(&outcome.task_id) {
                state.sink_failures.push(outcome.task_id.clone());
            }
        }

        let snapshot = match pass {
            Pass::Main => observer.tracker.record(&outcome),
            Pass::Requeue => observer.tracker.record_requeued(&outcome),
        };

        if outcome.success {
            info!(
                task_id = %outcome.task_id,
                attempts = outcome.attempts_used,
                salvaged = outcome.result.is_salvaged(),
                completed = snapshot.completed,
                total = snapshot.total,
                "Task completed"
            );
        } else {
            error!(
                task_id = %outcome.task_id,
                attempts = outcome.attempts_used,
                completed = snapshot.completed,
                total = snapshot.total,
                "Task failed"
            );
        }

        observer.events.emit_lossy(PipelineEvent::TaskCompleted {
            task_id: outcome.task_id.clone(),
            success: outcome.success,
            salvaged: outcome.result.is_salvaged(),
            attempts_used: outcome.attempts_used,
            snapshot,
        });

        state.outcomes.push(outcome);
    }
}

/// Turn a join result into an outcome; panics become failures
fn settle(task_id: &str, joined: Result<TaskOutcome, JoinError>) -> TaskOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            let reason = if e.is_panic() {
                "attempt panicked".to_string()
            } else {
                format!("attempt aborted: {}", e)
            };
            error!(task_id = %task_id, reason = %reason, "Attempt ended outside error handling");
            TaskOutcome::defect(task_id, reason)
        }
    }
}
