//! Data models for cityrules-analyzer
//!
//! Typed records passed between pipeline stages: tasks, attempts, raw
//! service results, structured results and final outcomes.

pub mod outcome;
pub mod task;

pub use outcome::{
    Attempt, RawResult, RawStatus, StructuredResult, TaskOutcome, TransientKind, Usage,
};
pub use task::{Attachment, Payload, Task};
