//! Pipeline event types and EventBus
//!
//! The scheduler broadcasts one event per lifecycle step. Subscribers
//! (the CLI progress printer, tests) consume them; the pipeline never waits
//! on a subscriber and never fails because nobody is listening.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Consistent point-in-time view of pipeline progress
///
/// Produced under the progress tracker's lock, so all fields describe the
/// same moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Outcomes recorded so far
    pub completed: usize,
    /// Tasks in the run
    pub total: usize,
    /// Outcomes recorded with `success = false`
    pub failed: usize,
    /// Seconds since the run started
    pub elapsed_secs: f64,
    /// Completions per second (0.0 before the first completion)
    pub rate_per_sec: f64,
    /// Estimated seconds remaining; `None` while the rate is unknown
    pub eta_secs: Option<f64>,
}

impl ProgressSnapshot {
    /// Completion percentage (0.0 - 100.0)
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }
}

/// Final run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Tasks in the task source
    pub planned: usize,
    /// Tasks attempted (fewer than `planned` after cancellation)
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successful outcomes whose value came from salvage heuristics
    pub salvaged: usize,
    /// Failed task identifiers, in completion order
    pub failed_task_ids: Vec<String>,
    /// Tasks whose outcome could not be persisted
    pub sink_failures: Vec<String>,
    /// Run stopped early by operator interrupt
    pub cancelled: bool,
    pub elapsed_secs: f64,
    /// Service calls sent
    pub message_count: u64,
    /// Service calls beyond each task's first
    pub retry_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl RunSummary {
    /// Completed tasks per second over the whole run
    pub fn rate_per_sec(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.total as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }

    /// Success percentage (0.0 - 100.0)
    pub fn success_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64 * 100.0
    }
}

/// Pipeline event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// Scheduler seeded its first attempts
    RunStarted {
        run_id: Uuid,
        total: usize,
        concurrency: usize,
    },

    /// An attempt failed and the task will be retried
    AttemptFailed {
        task_id: String,
        attempt: u32,
        reason: String,
        /// Delay before the next attempt (0 for immediate retry)
        retry_in_ms: u64,
    },

    /// A task's outcome was recorded
    TaskCompleted {
        task_id: String,
        success: bool,
        /// Value came from salvage heuristics rather than a clean parse
        salvaged: bool,
        attempts_used: u32,
        snapshot: ProgressSnapshot,
    },

    /// Failed tasks are being requeued for one more pass
    RetryPassStarted { run_id: Uuid, tasks: usize },

    /// Scheduler finished (normally or after cancellation)
    RunFinished { summary: RunSummary },
}

/// Broadcast bus for [`PipelineEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PipelineEvent,
    ) -> Result<usize, broadcast::error::SendError<PipelineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(completed: usize, total: usize) -> ProgressSnapshot {
        ProgressSnapshot {
            completed,
            total,
            failed: 0,
            elapsed_secs: 1.0,
            rate_per_sec: completed as f64,
            eta_secs: None,
        }
    }

    #[test]
    fn test_percent() {
        assert_eq!(snapshot(5, 10).percent(), 50.0);
        assert_eq!(snapshot(0, 0).percent(), 100.0);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(10);
        let event = PipelineEvent::RunStarted {
            run_id: Uuid::new_v4(),
            total: 3,
            concurrency: 2,
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        bus.emit_lossy(PipelineEvent::TaskCompleted {
            task_id: "page_001".to_string(),
            success: true,
            salvaged: false,
            attempts_used: 1,
            snapshot: snapshot(1, 4),
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::TaskCompleted { task_id, snapshot, .. } => {
                assert_eq!(task_id, "page_001");
                assert_eq!(snapshot.completed, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = PipelineEvent::RetryPassStarted {
            run_id: Uuid::nil(),
            tasks: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RetryPassStarted");
        assert_eq!(json["tasks"], 2);
    }
}
