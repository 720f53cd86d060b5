//! Attempt results and final task outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// One execution of a task against the generation service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub task_id: String,
    /// 1-based attempt number within the task
    pub number: u32,
    pub started_at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(task_id: impl Into<String>, number: u32) -> Self {
        Self {
            task_id: task_id.into(),
            number,
            started_at: Utc::now(),
        }
    }
}

/// Why an attempt is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    /// Call exceeded its wall-clock timeout
    Timeout,
    /// Connection could not be established or was dropped
    Connection,
    /// Status code in the retryable set (429, 5xx gateway errors, ...)
    RetryableStatus,
    /// Success status but no meaningful content
    EmptyResponse,
}

/// Classification of one service call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatus {
    Ok,
    Transient(TransientKind),
    Fatal,
}

impl RawStatus {
    /// Short label used in logs and the interaction log
    pub fn label(&self) -> &'static str {
        match self {
            RawStatus::Ok => "success",
            RawStatus::Transient(TransientKind::Timeout) => "timeout",
            RawStatus::Transient(TransientKind::Connection) => "connection_error",
            RawStatus::Transient(TransientKind::RetryableStatus) => "retryable_status",
            RawStatus::Transient(TransientKind::EmptyResponse) => "empty_response",
            RawStatus::Fatal => "fatal_error",
        }
    }
}

/// Token counts reported by the service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Raw result of one service call
///
/// `body` holds the response text on success and the best available error
/// description otherwise (response body or transport error).
#[derive(Debug, Clone)]
pub struct RawResult {
    pub attempt: Attempt,
    pub status: RawStatus,
    pub http_status: Option<u16>,
    pub body: String,
    pub usage: Option<Usage>,
    pub response_time: Duration,
}

impl RawResult {
    /// Human-readable failure reason for logs and outcome records
    pub fn reason(&self) -> String {
        match (self.status, self.http_status) {
            (RawStatus::Ok, _) => "ok".to_string(),
            (status, Some(code)) => format!("{} (HTTP {})", status.label(), code),
            (status, None) if self.body.is_empty() => status.label().to_string(),
            (status, None) => format!("{}: {}", status.label(), self.body),
        }
    }
}

/// Value recovered from a raw body
///
/// `Salvaged` marks values rebuilt by repair heuristics. They are lower
/// confidence than `Parsed` and must stay distinguishable downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuredResult {
    Parsed {
        value: Value,
    },
    Salvaged {
        value: Value,
        notes: Vec<String>,
    },
    Failed {
        reason: String,
        raw_body: String,
    },
}

impl StructuredResult {
    pub fn failed(reason: impl Into<String>, raw_body: impl Into<String>) -> Self {
        StructuredResult::Failed {
            reason: reason.into(),
            raw_body: raw_body.into(),
        }
    }

    /// Recovered value, if any
    pub fn value(&self) -> Option<&Value> {
        match self {
            StructuredResult::Parsed { value } | StructuredResult::Salvaged { value, .. } => {
                Some(value)
            }
            StructuredResult::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StructuredResult::Failed { .. })
    }

    pub fn is_salvaged(&self) -> bool {
        matches!(self, StructuredResult::Salvaged { .. })
    }
}

/// Final, immutable record of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub result: StructuredResult,
    /// Service calls made for this task
    pub attempts_used: u32,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
}

impl TaskOutcome {
    /// Outcome whose success follows the structured result
    pub fn new(task_id: impl Into<String>, result: StructuredResult, attempts_used: u32) -> Self {
        let success = !result.is_failed();
        Self {
            task_id: task_id.into(),
            result,
            attempts_used,
            success,
            completed_at: Utc::now(),
        }
    }

    /// Failed outcome for an attempt that ended outside the error taxonomy
    pub fn defect(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(task_id, StructuredResult::failed(reason, String::new()), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_follows_result() {
        let ok = TaskOutcome::new("a", StructuredResult::Parsed { value: json!({}) }, 1);
        assert!(ok.success);

        let salvaged = TaskOutcome::new(
            "b",
            StructuredResult::Salvaged {
                value: json!([]),
                notes: vec!["closed 1 bracket".into()],
            },
            2,
        );
        assert!(salvaged.success);
        assert!(salvaged.result.is_salvaged());

        let failed = TaskOutcome::new("c", StructuredResult::failed("timeout", ""), 3);
        assert!(!failed.success);
        assert!(failed.result.value().is_none());
    }

    #[test]
    fn test_structured_result_keeps_provenance_in_json() {
        let result = StructuredResult::Salvaged {
            value: json!({"a": 1}),
            notes: vec!["truncation repair".into()],
        };
        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded["kind"], "salvaged");
        assert_eq!(encoded["notes"][0], "truncation repair");
    }

    #[test]
    fn test_reason_includes_http_status() {
        let raw = RawResult {
            attempt: Attempt::new("t", 1),
            status: RawStatus::Fatal,
            http_status: Some(401),
            body: "unauthorized".into(),
            usage: None,
            response_time: Duration::from_millis(5),
        };
        assert_eq!(raw.reason(), "fatal_error (HTTP 401)");
    }
}
