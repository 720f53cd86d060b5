//! Test Helper Utilities
//!
//! Shared stubs for scheduler and client tests: a scripted generation
//! service that records call timing and concurrency, and a sink that keeps
//! everything in memory.

#![allow(dead_code)]

use async_trait::async_trait;
use cityrules_analyzer::error::SinkError;
use cityrules_analyzer::models::{
    Attempt, Payload, RawResult, RawStatus, Task, TaskOutcome, TransientKind, Usage,
};
use cityrules_analyzer::services::generation_client::GenerationService;
use cityrules_analyzer::services::interaction_log::InteractionRecord;
use cityrules_analyzer::services::result_sink::ResultSink;
use cityrules_analyzer::services::task_source::TaskSource;
use cityrules_common::events::RunSummary;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Body returned for successful calls unless scripted otherwise
pub const VALID_JSON: &str = r#"{"rules": [{"name": "front_setback", "value": 20}]}"#;

/// Scripted reply for one call
#[derive(Debug, Clone)]
pub enum Reply {
    /// HTTP 200 with this content
    Body(String),
    /// HTTP 200 with no usable content
    Empty,
    Transient(TransientKind),
    /// Non-retryable status
    Fatal(u16),
    Panic,
}

impl Reply {
    pub fn json() -> Self {
        Reply::Body(VALID_JSON.to_string())
    }
}

/// One observed service call
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub task_id: String,
    pub attempt: u32,
    pub started: Instant,
    /// Calls in progress when this one started, itself included
    pub in_flight_at_start: usize,
}

/// Generation service stub
///
/// Each task id can have its own delay and a queue of replies; once the
/// queue is empty the default reply is used.
pub struct StubService {
    default_delay: Duration,
    delays: HashMap<String, Duration>,
    default_reply: Reply,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<CallRecord>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl StubService {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            delays: HashMap::new(),
            default_reply: Reply::json(),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_default_reply(mut self, reply: Reply) -> Self {
        self.default_reply = reply;
        self
    }

    pub fn with_delay(mut self, task_id: &str, delay: Duration) -> Self {
        self.delays.insert(task_id.to_string(), delay);
        self
    }

    /// Replies for successive calls of `task_id`
    pub fn with_script(self, task_id: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.to_string(), replies.into());
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task_id: &str) -> Vec<CallRecord> {
        self.calls()
            .into_iter()
            .filter(|c| c.task_id == task_id)
            .collect()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, task_id: &str) -> Reply {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(task_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

/// Decrements the in-flight count even when the call panics
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationService for StubService {
    async fn call(&self, attempt: Attempt, _payload: &Payload, timeout: Duration) -> RawResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(CallRecord {
            task_id: attempt.task_id.clone(),
            attempt: attempt.number,
            started: Instant::now(),
            in_flight_at_start: now,
        });

        let delay = self
            .delays
            .get(&attempt.task_id)
            .copied()
            .unwrap_or(self.default_delay);
        let started = Instant::now();
        if tokio::time::timeout(timeout, tokio::time::sleep(delay)).await.is_err() {
            return raw(attempt, RawStatus::Transient(TransientKind::Timeout), None, "", started);
        }

        match self.next_reply(&attempt.task_id) {
            Reply::Body(body) => raw(attempt, RawStatus::Ok, Some(200), &body, started),
            Reply::Empty => raw(
                attempt,
                RawStatus::Transient(TransientKind::EmptyResponse),
                Some(200),
                "",
                started,
            ),
            Reply::Transient(kind) => {
                let code = (kind == TransientKind::RetryableStatus).then_some(503);
                raw(attempt, RawStatus::Transient(kind), code, "service unavailable", started)
            }
            Reply::Fatal(code) => raw(attempt, RawStatus::Fatal, Some(code), "denied", started),
            Reply::Panic => panic!("stub service panicked for {}", attempt.task_id),
        }
    }
}

fn raw(
    attempt: Attempt,
    status: RawStatus,
    http_status: Option<u16>,
    body: &str,
    started: Instant,
) -> RawResult {
    let usage = (status == RawStatus::Ok).then_some(Usage {
        input_tokens: 100,
        output_tokens: 20,
    });
    RawResult {
        attempt,
        status,
        http_status,
        body: body.to_string(),
        usage,
        response_time: started.elapsed(),
    }
}

/// In-memory result sink
#[derive(Default)]
pub struct CollectingSink {
    persisted: Mutex<Vec<TaskOutcome>>,
    finished: Mutex<Option<(RunSummary, usize)>>,
    fail_ids: HashSet<String>,
    persist_delay: Duration,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write for these task ids
    pub fn failing_for(ids: &[&str]) -> Self {
        Self {
            fail_ids: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Every write takes `delay` before it lands
    pub fn with_persist_delay(mut self, delay: Duration) -> Self {
        self.persist_delay = delay;
        self
    }

    pub fn persisted(&self) -> Vec<TaskOutcome> {
        self.persisted.lock().unwrap().clone()
    }

    pub fn persisted_ids(&self) -> Vec<String> {
        self.persisted().into_iter().map(|o| o.task_id).collect()
    }

    /// Summary and number of interaction records passed to `finish`
    pub fn finished(&self) -> Option<(RunSummary, usize)> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for CollectingSink {
    async fn persist(&self, outcome: &TaskOutcome) -> Result<(), SinkError> {
        if !self.persist_delay.is_zero() {
            tokio::time::sleep(self.persist_delay).await;
        }
        if self.fail_ids.contains(&outcome.task_id) {
            return Err(SinkError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.persisted.lock().unwrap().push(outcome.clone());
        Ok(())
    }

    async fn finish(
        &self,
        summary: &RunSummary,
        interactions: &[InteractionRecord],
    ) -> Result<(), SinkError> {
        *self.finished.lock().unwrap() = Some((summary.clone(), interactions.len()));
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// `count` text tasks named `task_0`, `task_1`, ...
pub fn text_tasks(count: usize) -> TaskSource {
    TaskSource::from_tasks(
        (0..count)
            .map(|i| Task::new(format!("task_{}", i), Payload::text(format!("chapter {}", i))))
            .collect(),
    )
}

pub fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}
