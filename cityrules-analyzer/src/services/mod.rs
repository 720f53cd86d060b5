//! Pipeline services
//!
//! Each stage of a task's life has its own module: the task source builds
//! the work list, the generation client talks to the service, retry wraps a
//! task's attempts, the sanitizer turns bodies into structure, and the
//! tracker, interaction log and sinks record what happened.

pub mod generation_client;
pub mod interaction_log;
pub mod progress_tracker;
pub mod result_sink;
pub mod retry;
pub mod sanitizer;
pub mod task_source;

pub use generation_client::{ClientConfig, GenerationService, OpenRouterClient};
pub use interaction_log::{InteractionLog, InteractionRecord};
pub use progress_tracker::{PipelineStats, ProgressTracker};
pub use result_sink::{JsonFileSink, ResultSink, SqliteSink};
pub use retry::{run_task, AttemptObserver, NoopObserver, RetryPolicy};
pub use sanitizer::sanitize;
pub use task_source::TaskSource;
