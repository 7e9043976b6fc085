//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use castline::app::{App, AppParts, SharedState};
use castline::clock::{Clock, ManualClock, SharedClock, SharedSleeper};
use castline::config::{Config, StateBackend, StorageBackend};
use castline::models::{PostPayload, ScheduledItem};
use castline::publish::{PublishError, PublishReceipt, PublishRequest, Publisher, StaticCredentials};
use castline::storage::{InMemoryStore, Repositories};

/// Fixed start instant of every test clock
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// In-memory configuration with a single attempt per call and a webhook secret
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.shared_state.backend = StateBackend::Memory;
    config.resilience.max_attempts = 1;
    config.resilience.failure_threshold = 100;
    config.scheduler.max_retries = 3;
    config.scheduler.retry_base_delay_secs = 60;
    config.media.webhook_secret = Some("whsec_test".to_string());
    config
}

/// One scripted publisher response
#[derive(Debug, Clone)]
pub enum Step {
    Reply(Result<PublishReceipt, PublishError>),
    /// Sleep for real, long enough to trip the per-call timeout
    Stall(Duration),
}

/// Publisher double driven by a script
///
/// When the script runs out every call succeeds with `0xcast<n>`.
pub struct FakePublisher {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<PublishRequest>>,
    delay: Duration,
    /// Clock moved forward on every call
    clock: Option<(Arc<ManualClock>, Duration)>,
}

impl FakePublisher {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            clock: None,
        }
    }

    /// Every call takes `delay` of real time
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every call moves `clock` forward by `by`
    pub fn advancing(mut self, clock: Arc<ManualClock>, by: Duration) -> Self {
        self.clock = Some((clock, by));
        self
    }

    pub fn calls(&self) -> Vec<PublishRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };
        if let Some((clock, by)) = &self.clock {
            clock.advance(*by);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(result)) => result,
            Some(Step::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Err(PublishError::Connection("stalled call completed".to_string()))
            }
            None => Ok(PublishReceipt {
                external_ref: format!("0xcast{n}"),
            }),
        }
    }
}

pub fn receipt(hash: &str) -> Step {
    Step::Reply(Ok(PublishReceipt {
        external_ref: hash.to_string(),
    }))
}

/// Wired application over in-memory stores and a manual clock
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryStore>,
    pub publisher: Arc<FakePublisher>,
    pub app: Arc<App>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        Self::with_publisher(config, clock, FakePublisher::new())
    }

    pub fn with_publisher(config: Config, clock: Arc<ManualClock>, publisher: FakePublisher) -> Self {
        let shared = SharedState::in_memory(clock.clone());
        Self::with_shared(config, clock, publisher, shared)
    }

    /// Harness over caller-provided lock, idempotency and breaker stores
    pub fn with_shared(
        config: Config,
        clock: Arc<ManualClock>,
        publisher: FakePublisher,
        shared: SharedState,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let publisher = Arc::new(publisher);
        let shared_clock: SharedClock = clock.clone();
        let sleeper: SharedSleeper = clock.clone();

        let app = App::assemble(
            config,
            AppParts {
                clock: shared_clock,
                sleeper,
                repos: Repositories::from_store(store.clone()),
                shared,
                publisher: publisher.clone(),
                credentials: Arc::new(StaticCredentials::new(
                    Default::default(),
                    Some("token-default".to_string()),
                )),
                media_provider: None,
            },
        )
        .expect("assemble app");

        Self {
            clock,
            store,
            publisher,
            app: Arc::new(app),
        }
    }

    /// Insert a `scheduled` item due `minutes_ago` minutes before now
    pub async fn due_item(&self, id: &str, minutes_ago: i64) -> ScheduledItem {
        let at = self.clock.now() - chrono::Duration::minutes(minutes_ago);
        let item = ScheduledItem::scheduled(
            "owner-1",
            PostPayload {
                content: format!("post {id}"),
                destination: "general".to_string(),
                ..Default::default()
            },
            at,
        )
        .with_id(id);
        self.app.repos.items.create_item(&item).await.unwrap();
        item
    }

    pub async fn item(&self, id: &str) -> ScheduledItem {
        self.app.repos.items.get_item(id).await.unwrap().unwrap()
    }
}
