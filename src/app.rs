//! Component wiring
//!
//! [`App::from_config`] builds every component from configuration: record
//! storage, the shared-state backend (lock, idempotency, breaker), the
//! upstream publisher, the per-item pipeline, the scheduler and the media
//! processor. Tests use [`App::assemble`] with their own parts.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::clock::{SharedClock, SharedSleeper, SystemClock, TokioSleeper};
use crate::config::{Config, StateBackend, StorageBackend};
use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
use crate::lock::{DistributedLock, InMemoryLock};
use crate::media::{DeliveryUrls, HttpMediaProvider, MediaProcessor, MediaProvider};
use crate::publish::{CredentialSource, HttpPublisher, Publisher, StaticCredentials};
use crate::resilience::{
    BreakerSettings, BreakerStore, CircuitBreakerRegistry, InMemoryBreakerStore, RetryPolicy,
};
use crate::scheduler::{DueCastScheduler, PipelineSettings, PublishPipeline};
use crate::shared::RedisStore;
use crate::storage::{InMemoryStore, Repositories, SqliteStore};

/// Shared-state backend: lock, idempotency and breaker stores
#[derive(Clone)]
pub struct SharedState {
    pub lock: Arc<dyn DistributedLock>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub breakers: Arc<dyn BreakerStore>,
}

impl SharedState {
    /// Process-local state
    pub fn in_memory(clock: SharedClock) -> Self {
        Self {
            lock: Arc::new(InMemoryLock::new(clock.clone())),
            idempotency: Arc::new(InMemoryIdempotencyStore::new(clock)),
            breakers: Arc::new(InMemoryBreakerStore::new()),
        }
    }

    /// Every store on one backend object
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: DistributedLock + IdempotencyStore + BreakerStore + 'static,
    {
        Self {
            lock: store.clone(),
            idempotency: store.clone(),
            breakers: store,
        }
    }
}

/// Everything [`App::assemble`] needs besides configuration
pub struct AppParts {
    pub clock: SharedClock,
    pub sleeper: SharedSleeper,
    pub repos: Repositories,
    pub shared: SharedState,
    pub publisher: Arc<dyn Publisher>,
    pub credentials: Arc<dyn CredentialSource>,
    pub media_provider: Option<Arc<dyn MediaProvider>>,
}

/// Wired application
pub struct App {
    pub config: Config,
    pub clock: SharedClock,
    pub repos: Repositories,
    pub shared: SharedState,
    pub breaker: Arc<CircuitBreakerRegistry>,
    pub pipeline: Arc<PublishPipeline>,
    pub scheduler: Arc<DueCastScheduler>,
    pub media: Arc<MediaProcessor>,
    pub media_provider: Option<Arc<dyn MediaProvider>>,
}

impl App {
    /// Build production components from configuration
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let clock: SharedClock = Arc::new(SystemClock);
        let sleeper: SharedSleeper = Arc::new(TokioSleeper);

        let (repos, sqlite) = match config.storage.backend {
            StorageBackend::Memory => (Repositories::from_store(Arc::new(InMemoryStore::new())), None),
            StorageBackend::Sqlite => {
                let store = Arc::new(SqliteStore::open(&config.storage.sqlite_path, clock.clone())?);
                (Repositories::from_store(store.clone()), Some(store))
            }
        };

        let shared = match config.shared_state.backend {
            StateBackend::Memory => SharedState::in_memory(clock.clone()),
            StateBackend::Sqlite => {
                let store = sqlite.context("sqlite shared state requires sqlite storage")?;
                SharedState::from_store(store)
            }
            StateBackend::Redis => {
                let store = RedisStore::new(&config.shared_state, clock.clone()).await?;
                SharedState::from_store(Arc::new(store))
            }
        };

        let publisher = Arc::new(HttpPublisher::from_config(&config.upstream)?);
        let credentials = Arc::new(StaticCredentials::from_config(&config.upstream));
        let media_provider = HttpMediaProvider::from_config(&config.media)?
            .map(|p| Arc::new(p) as Arc<dyn MediaProvider>);

        info!(
            storage = ?config.storage.backend,
            shared_state = ?config.shared_state.backend,
            upstream = %config.upstream.base_url,
            "Components configured"
        );

        Self::assemble(
            config,
            AppParts {
                clock,
                sleeper,
                repos,
                shared,
                publisher,
                credentials,
                media_provider,
            },
        )
    }

    /// Wire the pipeline, scheduler and media processor from parts
    pub fn assemble(config: Config, parts: AppParts) -> Result<Self> {
        let breaker = Arc::new(CircuitBreakerRegistry::new(
            parts.shared.breakers.clone(),
            BreakerSettings::from(&config.resilience),
            parts.clock.clone(),
        ));
        let retry = Arc::new(RetryPolicy::from_config(
            &config.resilience,
            breaker.clone(),
            parts.sleeper,
        ));

        let pipeline = Arc::new(PublishPipeline::new(
            parts.repos.items.clone(),
            parts.repos.media.clone(),
            parts.shared.idempotency.clone(),
            parts.publisher,
            parts.credentials,
            retry,
            parts.clock.clone(),
            PipelineSettings::from_config(&config),
        ));

        let scheduler = Arc::new(DueCastScheduler::new(
            parts.shared.lock.clone(),
            parts.repos.items.clone(),
            parts.repos.runs.clone(),
            pipeline.clone(),
            parts.clock.clone(),
            &config.scheduler,
        ));

        let media = Arc::new(MediaProcessor::new(
            parts.repos.media.clone(),
            DeliveryUrls::from_config(&config.media)?,
        ));

        Ok(Self {
            config,
            clock: parts.clock,
            repos: parts.repos,
            shared: parts.shared,
            breaker,
            pipeline,
            scheduler,
            media,
            media_provider: parts.media_provider,
        })
    }
}
