//! Run orchestration
//!
//! [`Scheduler`] drives a [`TaskSource`](crate::services::task_source::TaskSource)
//! through the generation service with a fixed number of tasks in flight and
//! returns a [`RunReport`].

pub mod report;
pub mod scheduler;

pub use report::{render_summary, RunReport};
pub use scheduler::{InFlightGauge, Scheduler};
