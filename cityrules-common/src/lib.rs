//! # cityrules common library
//!
//! Shared code for the cityrules crates:
//! - Error type
//! - Configuration loading and resolution
//! - Pipeline event types and EventBus
//! - Human-readable duration formatting

pub mod config;
pub mod error;
pub mod events;
pub mod human_time;

pub use error::{Error, Result};
