//! Integration tests for config file lookup
//!
//! Lookup order: explicit path, then `CITYRULES_CONFIG`, then the per-user
//! config directory, then built-in defaults.
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Every test here touches CITYRULES_CONFIG or XDG_CONFIG_HOME.

use cityrules_common::config::{
    load_config, write_toml_config, SinkKind, TomlConfig, CONFIG_PATH_ENV,
};
use serial_test::serial;
use std::env;
use std::path::Path;
use tempfile::TempDir;

fn write_config(path: &Path, concurrency: usize) {
    let mut config = TomlConfig::default();
    config.pipeline.concurrency = concurrency;
    write_toml_config(&config, path).unwrap();
}

/// Point the per-user config directory at `dir` (Linux: XDG_CONFIG_HOME)
fn isolate_user_config(dir: &Path) {
    env::set_var("XDG_CONFIG_HOME", dir);
    env::remove_var(CONFIG_PATH_ENV);
}

#[test]
#[serial]
fn test_explicit_path_wins_over_env() {
    let temp = TempDir::new().unwrap();
    isolate_user_config(temp.path());

    let explicit = temp.path().join("explicit.toml");
    let from_env = temp.path().join("env.toml");
    write_config(&explicit, 2);
    write_config(&from_env, 5);
    env::set_var(CONFIG_PATH_ENV, &from_env);

    let config = load_config(Some(&explicit)).unwrap();
    assert_eq!(config.pipeline.concurrency, 2);

    env::remove_var(CONFIG_PATH_ENV);
}

#[test]
#[serial]
fn test_env_path_used_without_explicit_path() {
    let temp = TempDir::new().unwrap();
    isolate_user_config(temp.path());

    let from_env = temp.path().join("env.toml");
    write_config(&from_env, 5);
    env::set_var(CONFIG_PATH_ENV, &from_env);

    let config = load_config(None).unwrap();
    assert_eq!(config.pipeline.concurrency, 5);

    env::remove_var(CONFIG_PATH_ENV);
}

#[cfg(target_os = "linux")]
#[test]
#[serial]
fn test_user_config_dir_used_last() {
    let temp = TempDir::new().unwrap();
    isolate_user_config(temp.path());

    let user_file = temp.path().join("cityrules").join("config.toml");
    write_config(&user_file, 12);

    let config = load_config(None).unwrap();
    assert_eq!(config.pipeline.concurrency, 12);

    // A dangling env path is ignored, not fatal
    env::set_var(CONFIG_PATH_ENV, temp.path().join("missing.toml"));
    let config = load_config(None).unwrap();
    assert_eq!(config.pipeline.concurrency, 12);

    env::remove_var(CONFIG_PATH_ENV);
}

#[cfg(target_os = "linux")]
#[test]
#[serial]
fn test_no_file_anywhere_gives_defaults() {
    let temp = TempDir::new().unwrap();
    isolate_user_config(temp.path());

    let config = load_config(None).unwrap();
    assert_eq!(config, TomlConfig::default());
    assert_eq!(config.output.sink, SinkKind::Json);
}

#[test]
#[serial]
fn test_full_file_round_trips_every_section() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("cityrules.toml");
    std::fs::write(
        &path,
        r#"
        [service]
        model = "anthropic/claude-sonnet-4"
        temperature = 0.0
        max_tokens = 4000

        [pipeline]
        concurrency = 4
        max_attempts = 5
        backoff_base_ms = 1000
        requests_per_second = 3
        retry_failed_pass = true

        [output]
        root = "/tmp/cityrules-out"
        sink = "sqlite"

        [logging]
        level = "debug"
        "#,
    )
    .unwrap();

    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.service.model, "anthropic/claude-sonnet-4");
    assert_eq!(config.service.max_tokens, 4000);
    assert_eq!(config.pipeline.max_attempts, 5);
    assert_eq!(config.pipeline.requests_per_second, Some(3));
    assert!(config.pipeline.retry_failed_pass);
    assert!(!config.pipeline.sanitizer_retry);
    assert_eq!(config.output.sink, SinkKind::Sqlite);
    assert_eq!(config.logging.level, "debug");
    // Unset fields keep their defaults
    assert_eq!(config.pipeline.request_timeout_secs, 180);
    assert!(config.service.api_key.is_none());
}
