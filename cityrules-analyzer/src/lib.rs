//! cityrules-analyzer library interface
//!
//! Bounded-concurrency document analysis: every task (a page image or a
//! markdown chapter) is sent to an LLM generation service, the reply is
//! sanitized into JSON and the outcome is persisted as soon as it arrives.
//!
//! Exposes public APIs for the binary and for integration testing.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod workflow;

pub use crate::error::{PipelineError, PipelineResult};
pub use crate::workflow::{RunReport, Scheduler};
