//! SQLite-backed application wiring
//!
//! Records, runs, the lock and idempotency records all live in one database
//! file and survive a restart of the process.

use castline::app::App;
use castline::config::{Config, StateBackend, StorageBackend};
use castline::idempotency::Lookup;
use castline::lock::AcquireOutcome;
use castline::models::{ItemStatus, PostPayload, ScheduledItem};
use castline::scheduler::RunRequest;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sqlite_config(dir: &TempDir, upstream: &str) -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.sqlite_path = dir.path().join("data").join("castline.db");
    config.shared_state.backend = StateBackend::Sqlite;
    config.upstream.base_url = upstream.to_string();
    config.upstream.default_credential = Some("token-sqlite".to_string());
    config.resilience.max_attempts = 1;
    config
}

fn due_item(id: &str) -> ScheduledItem {
    ScheduledItem::scheduled(
        "owner-1",
        PostPayload {
            content: "from sqlite".to_string(),
            destination: "general".to_string(),
            ..Default::default()
        },
        Utc::now() - chrono::Duration::minutes(1),
    )
    .with_id(id)
}

#[tokio::test]
async fn test_sqlite_app_publishes_and_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/casts"))
        .and(header("idempotency-key", "cast:item-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "cast": { "hash": "0xdisk" } })),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = sqlite_config(&temp_dir, &mock_server.uri());

    let run_id = {
        let app = App::from_config(config.clone()).await.unwrap();
        app.repos.items.create_item(&due_item("item-1")).await.unwrap();

        let report = app
            .scheduler
            .run(RunRequest::from_config("test", &app.config.scheduler))
            .await;
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.counts.published, 1);
        report.run_id.unwrap()
    };

    // Restart on the same database file
    let app = App::from_config(config).await.unwrap();

    let item = app.repos.items.get_item("item-1").await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Published);
    assert_eq!(item.external_ref.as_deref(), Some("0xdisk"));

    let run = app.repos.runs.get_run(&run_id).await.unwrap().unwrap();
    assert!(run.success);
    assert_eq!(run.counts.published, 1);

    let recorded = app
        .shared
        .idempotency
        .get_or_reserve("cast:item-1", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(matches!(recorded, Lookup::Found(record) if record.status == 200));

    // Nothing left to publish
    let report = app
        .scheduler
        .run(RunRequest::from_config("test", &app.config.scheduler))
        .await;
    assert_eq!(report.counts.processed, 0);
}

#[tokio::test]
async fn test_sqlite_lock_is_shared_between_instances() {
    let temp_dir = TempDir::new().unwrap();
    let config = sqlite_config(&temp_dir, "http://127.0.0.1:9");

    let first = App::from_config(config.clone()).await.unwrap();
    let second = App::from_config(config).await.unwrap();

    let lock_key = first.config.scheduler.lock_key.clone();
    let grant = match first
        .shared
        .lock
        .acquire(&lock_key, Duration::from_secs(60))
        .await
        .unwrap()
    {
        AcquireOutcome::Granted(grant) => grant,
        AcquireOutcome::Denied => panic!("fresh lock should be granted"),
    };

    // The other instance sees the lease and skips its run
    let report = second
        .scheduler
        .run(RunRequest::from_config("test", &second.config.scheduler))
        .await;
    assert!(report.skipped);
    assert!(report.success);

    // A release with a foreign token is a no-op
    assert!(!second.shared.lock.release(&lock_key, "not-the-owner").await.unwrap());
    assert!(first.shared.lock.release(&lock_key, &grant.owner_token).await.unwrap());

    let report = second
        .scheduler
        .run(RunRequest::from_config("test", &second.config.scheduler))
        .await;
    assert!(!report.skipped);
}
