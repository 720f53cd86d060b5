//! Configuration loading and resolution
//!
//! Settings are resolved in priority order:
//! 1. Command-line argument (highest priority, applied by the binary)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing config file is not an error: every field carries a serde
//! default, so an absent or partial file still yields a complete config.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "CITYRULES_CONFIG";

/// Environment variable holding the generation service API key
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Default chat-completions endpoint
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model identifier sent with every request
pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash";

/// Bootstrap configuration loaded from `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// External generation service settings
    pub service: ServiceConfig,
    /// Scheduler, retry and client tuning
    pub pipeline: PipelineSettings,
    /// Where results are persisted
    pub output: OutputConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Generation service settings (`[service]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// API key (lowest priority; `OPENROUTER_API_KEY` wins)
    pub api_key: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.1,
            max_tokens: 8000,
            api_key: None,
        }
    }
}

/// Pipeline tuning (`[pipeline]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Number of attempts kept in flight
    pub concurrency: usize,
    /// Maximum service calls per task
    pub max_attempts: u32,
    /// Base delay for exponential backoff (milliseconds)
    pub backoff_base_ms: u64,
    /// Hard wall-clock timeout per call (seconds)
    pub request_timeout_secs: u64,
    /// Minimum non-whitespace characters for a body to count as content
    pub min_content_chars: usize,
    /// Optional client-side request rate limit
    pub requests_per_second: Option<u32>,
    /// Resample once when the sanitizer cannot recover any structure
    pub sanitizer_retry: bool,
    /// Requeue failed tasks once after the main pass
    pub retry_failed_pass: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_attempts: 3,
            backoff_base_ms: 2000,
            request_timeout_secs: 180,
            min_content_chars: 10,
            requests_per_second: None,
            sanitizer_retry: false,
            retry_failed_pass: false,
        }
    }
}

/// Result sink selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// One JSON file per task in a timestamped run directory
    #[default]
    Json,
    /// Rows in a SQLite database inside the output root
    Sqlite,
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(SinkKind::Json),
            "sqlite" => Ok(SinkKind::Sqlite),
            other => Err(format!("unknown sink '{}' (expected json or sqlite)", other)),
        }
    }
}

/// Output settings (`[output]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory under which run directories / the database are created
    pub root: PathBuf,
    pub sink: SinkKind,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            sink: SinkKind::Json,
        }
    }
}

/// Logging configuration (`[logging]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Per-user config file location (`~/.config/cityrules/config.toml` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cityrules").join("config.toml"))
}

/// Load configuration following the lookup order
///
/// 1. `cli_path` (must exist if given)
/// 2. `CITYRULES_CONFIG` environment variable
/// 3. [`default_config_path`]
///
/// Falls back to compiled defaults with a warning when no file is found.
pub fn load_config(cli_path: Option<&Path>) -> Result<TomlConfig> {
    if let Some(path) = cli_path {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        return load_toml_config(path);
    }

    if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return load_toml_config(&path);
        }
        warn!(
            "{} points to missing file {}, ignoring",
            CONFIG_PATH_ENV,
            path.display()
        );
    }

    if let Some(path) = default_config_path() {
        if path.exists() {
            return load_toml_config(&path);
        }
    }

    warn!("No config file found, using built-in defaults");
    Ok(TomlConfig::default())
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Write a config file atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;

    debug!("Wrote configuration to {}", path.display());
    Ok(())
}

/// Resolve the API key from environment, then TOML
///
/// Empty or whitespace-only keys are treated as absent.
pub fn resolve_api_key(config: &TomlConfig) -> Result<String> {
    let env_key = std::env::var(API_KEY_ENV).ok().filter(|k| is_valid_key(k));
    let toml_key = config
        .service
        .api_key
        .as_ref()
        .filter(|k| is_valid_key(k))
        .cloned();

    if env_key.is_some() && toml_key.is_some() {
        warn!(
            "API key found in both environment and TOML. Using {} (higher priority).",
            API_KEY_ENV
        );
    }

    if let Some(key) = env_key {
        info!("API key loaded from environment variable");
        return Ok(key);
    }

    if let Some(key) = toml_key {
        info!("API key loaded from TOML config");
        return Ok(key);
    }

    Err(Error::Config(format!(
        "API key not configured. Please configure using one of:\n\
         1. Environment: {}=your-key-here\n\
         2. TOML config: [service] api_key = \"your-key\" in {}",
        API_KEY_ENV,
        default_config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "config.toml".to_string())
    )))
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}
