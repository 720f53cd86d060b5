//! Per-attempt interaction log
//!
//! One record per service call, kept in memory for the run and written by
//! the result sink when the run finishes.

use crate::models::RawResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// Longest error excerpt kept per record
const MAX_ERROR_EXCERPT: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub attempt: u32,
    /// Classification label (`success`, `timeout`, `empty_response`, ...)
    pub status: String,
    pub http_status: Option<u16>,
    pub response_time_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Characters in the response body
    pub content_length: usize,
    pub error: Option<String>,
}

impl InteractionRecord {
    pub fn from_raw(raw: &RawResult) -> Self {
        let usage = raw.usage.unwrap_or_default();
        let error = match raw.status {
            crate::models::RawStatus::Ok => None,
            _ => Some(excerpt(&raw.reason())),
        };
        Self {
            timestamp: raw.attempt.started_at,
            task_id: raw.attempt.task_id.clone(),
            attempt: raw.attempt.number,
            status: raw.status.label().to_string(),
            http_status: raw.http_status,
            response_time_ms: raw.response_time.as_millis() as u64,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            content_length: raw.body.chars().count(),
            error,
        }
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= MAX_ERROR_EXCERPT {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(MAX_ERROR_EXCERPT).collect();
        cut.push_str("...");
        cut
    }
}

/// Append-only, thread-safe list of [`InteractionRecord`]s
#[derive(Debug, Default)]
pub struct InteractionLog {
    records: Mutex<Vec<InteractionRecord>>,
}

impl InteractionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, raw: &RawResult) {
        let record = InteractionRecord::from_raw(raw);
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Copy of all records in call order
    pub fn records(&self) -> Vec<InteractionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
