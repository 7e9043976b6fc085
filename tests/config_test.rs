//! Configuration loading tests

use castline::config::{Config, StateBackend, StorageBackend};
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const EXAMPLE: &str = include_str!("../castline.example.toml");

#[test]
fn test_example_config_parses_and_validates() {
    let config = Config::from_toml_str(EXAMPLE).unwrap();
    config.validate().unwrap();

    assert_eq!(config.scheduler.job_name, "publish-due-casts");
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(config.shared_state.backend, StateBackend::Sqlite);
    assert_eq!(config.idempotency.ttl_secs, 86_400);
    assert!(config.upstream.credentials.is_empty());
}

#[test]
fn test_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        [server]
        bind_address = "127.0.0.1:9100"
        cron_secret = "s3cret"

        [scheduler]
        poll_interval_secs = 30

        [upstream.credentials]
        "owner-1" = "token-1"
        "#
    )
    .unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.bind_address().unwrap().port(), 9100);
    assert_eq!(config.server.cron_secret.as_deref(), Some("s3cret"));
    assert_eq!(config.scheduler.poll_interval_secs, 30);
    assert_eq!(
        config.upstream.credentials.get("owner-1").map(String::as_str),
        Some("token-1")
    );
}

#[test]
fn test_from_file_reports_path_on_error() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/castline.toml")).unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/castline.toml"));
}

#[test]
fn test_lock_ttl_must_outlast_a_full_run() {
    let mut config = Config::default();
    config.scheduler.max_duration_secs = 120;
    config.scheduler.per_call_timeout_secs = 10;
    config.resilience.max_attempts = 3;

    // 120s budget + 3 x 10s timeouts + jittered delays > 150s
    config.scheduler.lock_ttl_secs = 150;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("lock_ttl_secs"));

    config.scheduler.lock_ttl_secs = 200;
    assert!(config.validate().is_ok());
    assert!(config.worst_case_item_duration() > Duration::from_secs(30));
}

#[test]
#[serial]
fn test_from_env_overrides() {
    std::env::set_var("CASTLINE_STORAGE_BACKEND", "memory");
    std::env::set_var("CASTLINE_STATE_BACKEND", "memory");
    std::env::set_var("CASTLINE_MAX_ITEMS", "7");
    std::env::set_var("CASTLINE_CRON_SECRET", "from-env");
    std::env::set_var("CASTLINE_POLL_INTERVAL_SECS", "not-a-number");

    let config = Config::from_env().unwrap();

    std::env::remove_var("CASTLINE_STORAGE_BACKEND");
    std::env::remove_var("CASTLINE_STATE_BACKEND");
    std::env::remove_var("CASTLINE_MAX_ITEMS");
    std::env::remove_var("CASTLINE_CRON_SECRET");
    std::env::remove_var("CASTLINE_POLL_INTERVAL_SECS");

    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.shared_state.backend, StateBackend::Memory);
    assert_eq!(config.scheduler.max_items, 7);
    assert_eq!(config.server.cron_secret.as_deref(), Some("from-env"));
    // Unparseable values fall back to the default
    assert_eq!(config.scheduler.poll_interval_secs, 0);
}

#[test]
#[serial]
fn test_from_env_rejects_unknown_backend() {
    std::env::set_var("CASTLINE_STATE_BACKEND", "etcd");
    let result = Config::from_env();
    std::env::remove_var("CASTLINE_STATE_BACKEND");

    assert!(result.is_err());
}

#[test]
fn test_claim_and_reservation_must_outlast_one_item() {
    let mut config = Config::default();
    config.scheduler.per_call_timeout_secs = 10;
    config.resilience.max_attempts = 3;
    let item = config.worst_case_item_duration().as_secs();

    config.scheduler.stale_publishing_secs = item;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("stale_publishing_secs"));

    config.scheduler.stale_publishing_secs = 900;
    config.idempotency.reservation_ttl_secs = 20;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("reservation_ttl_secs"));

    config.idempotency.reservation_ttl_secs = 120;
    assert!(config.validate().is_ok());
}
