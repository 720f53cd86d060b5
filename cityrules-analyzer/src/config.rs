//! Run configuration for cityrules-analyzer
//!
//! Resolution priority: CLI flag → environment variable → TOML → default.
//! Clap handles the first two (`env = ...` on each flag); the result is
//! applied on top of the loaded [`TomlConfig`] with [`apply_overrides`].

use crate::error::PipelineError;
use crate::services::generation_client::ClientConfig;
use crate::services::retry::RetryPolicy;
use cityrules_common::config::{PipelineSettings, SinkKind, TomlConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Values supplied on the command line (or their env fallbacks)
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub model: Option<String>,
    pub output_root: Option<PathBuf>,
    pub sink: Option<SinkKind>,
    pub retry_failed: bool,
    pub sanitizer_retry: bool,
}

/// Layer CLI/env overrides on top of the file configuration
pub fn apply_overrides(config: &mut TomlConfig, overrides: &Overrides) {
    if let Some(concurrency) = overrides.concurrency {
        config.pipeline.concurrency = concurrency;
    }
    if let Some(max_attempts) = overrides.max_attempts {
        config.pipeline.max_attempts = max_attempts;
    }
    if let Some(model) = &overrides.model {
        config.service.model = model.clone();
    }
    if let Some(root) = &overrides.output_root {
        config.output.root = root.clone();
    }
    if let Some(sink) = overrides.sink {
        config.output.sink = sink;
    }
    // Flags only switch features on; the file can enable them too
    if overrides.retry_failed {
        config.pipeline.retry_failed_pass = true;
    }
    if overrides.sanitizer_retry {
        config.pipeline.sanitizer_retry = true;
    }
}

/// Scheduler and retry settings for one run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Attempts kept in flight
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Hard wall-clock timeout per service call
    pub call_timeout: Duration,
    /// Requeue failed tasks once after the main pass
    pub retry_failed_pass: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default())
    }
}

impl PipelineConfig {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            concurrency: settings.concurrency,
            retry: RetryPolicy {
                max_attempts: settings.max_attempts,
                base_delay: Duration::from_millis(settings.backoff_base_ms),
                sanitizer_retry: settings.sanitizer_retry,
                ..RetryPolicy::default()
            },
            call_timeout: Duration::from_secs(settings.request_timeout_secs),
            retry_failed_pass: settings.retry_failed_pass,
        }
    }

    /// Reject settings that cannot drive a run
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client settings from the file configuration plus a resolved API key
pub fn client_config(config: &TomlConfig, api_key: String) -> ClientConfig {
    ClientConfig {
        base_url: config.service.base_url.clone(),
        api_key,
        model: config.service.model.clone(),
        temperature: config.service.temperature,
        max_tokens: config.service.max_tokens,
        min_content_chars: config.pipeline.min_content_chars,
        requests_per_second: config.pipeline.requests_per_second,
    }
}
