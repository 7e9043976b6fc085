//! Configuration management for castline
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files. Every section has sensible defaults so a partial
//! file only needs to name what it overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Due-cast scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Retry and circuit breaker configuration for outbound calls
    pub resilience: ResilienceConfig,

    /// Idempotency store configuration
    pub idempotency: IdempotencyConfig,

    /// Media transcoding configuration
    pub media: MediaConfig,

    /// Upstream publishing API configuration
    pub upstream: UpstreamConfig,

    /// Item, run and media record storage
    pub storage: StorageConfig,

    /// Backing store for lock, idempotency and breaker state
    pub shared_state: SharedStateConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,

    /// Enable CORS for API
    pub enable_cors: bool,

    /// Enable request logging
    pub enable_request_logging: bool,

    /// Shared secret expected on trigger requests (optional)
    pub cron_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("0.0.0.0:8080"),
            enable_cors: false,
            enable_request_logging: true,
            cron_secret: None,
        }
    }
}

/// Due-cast scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Job name recorded on every cron run
    pub job_name: String,

    /// Distributed lock key guarding the run
    pub lock_key: String,

    /// Lock lease duration in seconds
    pub lock_ttl_secs: u64,

    /// Maximum items selected per run
    pub max_items: usize,

    /// Soft run deadline in seconds, checked between items
    pub max_duration_secs: u64,

    /// Timeout of a single upstream call attempt in seconds
    pub per_call_timeout_secs: u64,

    /// Failed attempts an item may retry before it is marked failed
    pub max_retries: u32,

    /// First item-level retry delay in seconds
    pub retry_base_delay_secs: u64,

    /// Cap on item-level retry delay in seconds
    pub retry_max_delay_secs: u64,

    /// Multiplier for item-level exponential backoff
    pub retry_multiplier: f64,

    /// Items claimed longer ago than this are re-classified to retrying
    pub stale_publishing_secs: u64,

    /// Internal trigger interval in seconds (0 disables it)
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_name: String::from("publish-due-casts"),
            lock_key: String::from("lock:publish-due-casts"),
            lock_ttl_secs: 300,
            max_items: 50,
            max_duration_secs: 120,
            per_call_timeout_secs: 10,
            max_retries: 3,
            retry_base_delay_secs: 60,
            retry_max_delay_secs: 3600,
            retry_multiplier: 2.0,
            stale_publishing_secs: 900,
            poll_interval_secs: 0,
        }
    }
}

/// Retry and circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Total attempts per call, including the first
    pub max_attempts: u32,

    /// Base delay in milliseconds between attempts
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between attempts
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Fraction of each delay randomized (0.0 - 1.0)
    pub jitter_ratio: f64,

    /// Consecutive transient failures that open the circuit
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before admitting a probe
    pub cooldown_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.2,
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// Idempotency store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Lifetime of a recorded outcome in seconds
    pub ttl_secs: u64,

    /// Lifetime of an in-progress reservation in seconds
    pub reservation_ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            reservation_ttl_secs: 120,
        }
    }
}

/// Media transcoding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Shared secret used to verify provider webhook signatures
    pub webhook_secret: Option<String>,

    /// Base URL of the streaming delivery host
    pub stream_base_url: String,

    /// Base URL of the image/thumbnail delivery host
    pub image_base_url: String,

    /// Provider API base URL used for manual status confirmation
    pub provider_api_url: Option<String>,

    /// Provider API token
    pub provider_token: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            stream_base_url: String::from("https://stream.castline.dev"),
            image_base_url: String::from("https://image.castline.dev"),
            provider_api_url: None,
            provider_token: None,
        }
    }
}

/// Upstream publishing API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the social-graph publishing API
    pub base_url: String,

    /// Circuit breaker key for the publish endpoint
    pub endpoint_key: String,

    /// Credential used when an account has no dedicated one
    pub default_credential: Option<String>,

    /// Per-account credentials keyed by owner reference
    pub credentials: HashMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("http://localhost:9000"),
            endpoint_key: String::from("upstream:publish"),
            default_credential: None,
            credentials: HashMap::new(),
        }
    }
}

/// Record storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: PathBuf::from("data/castline.db"),
        }
    }
}

/// Shared-state backend for lock, idempotency and breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    Memory,
    Sqlite,
    Redis,
}

/// Shared-state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedStateConfig {
    pub backend: StateBackend,

    /// Redis URL (e.g., redis://localhost:6379)
    pub redis_url: String,

    /// Connection pool size
    pub pool_size: usize,

    /// Key prefix for namespacing
    pub key_prefix: String,
}

impl Default for SharedStateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Sqlite,
            redis_url: String::from("redis://localhost:6379"),
            pool_size: 8,
            key_prefix: String::from("castline"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let storage_backend = match std::env::var("CASTLINE_STORAGE_BACKEND").ok().as_deref() {
            Some("memory") => StorageBackend::Memory,
            Some("sqlite") | None => StorageBackend::Sqlite,
            Some(other) => anyhow::bail!("Unknown CASTLINE_STORAGE_BACKEND: {other}"),
        };

        let state_backend = match std::env::var("CASTLINE_STATE_BACKEND").ok().as_deref() {
            Some("memory") => StateBackend::Memory,
            Some("redis") => StateBackend::Redis,
            Some("sqlite") | None => StateBackend::Sqlite,
            Some(other) => anyhow::bail!("Unknown CASTLINE_STATE_BACKEND: {other}"),
        };

        Ok(Self {
            server: ServerConfig {
                bind_address: std::env::var("CASTLINE_BIND_ADDRESS")
                    .unwrap_or(defaults.server.bind_address),
                enable_cors: env_parse("CASTLINE_ENABLE_CORS", defaults.server.enable_cors),
                enable_request_logging: env_parse(
                    "CASTLINE_REQUEST_LOGGING",
                    defaults.server.enable_request_logging,
                ),
                cron_secret: std::env::var("CASTLINE_CRON_SECRET").ok(),
            },
            scheduler: SchedulerConfig {
                lock_ttl_secs: env_parse("CASTLINE_LOCK_TTL_SECS", defaults.scheduler.lock_ttl_secs),
                max_items: env_parse("CASTLINE_MAX_ITEMS", defaults.scheduler.max_items),
                max_duration_secs: env_parse(
                    "CASTLINE_MAX_DURATION_SECS",
                    defaults.scheduler.max_duration_secs,
                ),
                per_call_timeout_secs: env_parse(
                    "CASTLINE_PER_CALL_TIMEOUT_SECS",
                    defaults.scheduler.per_call_timeout_secs,
                ),
                max_retries: env_parse("CASTLINE_MAX_RETRIES", defaults.scheduler.max_retries),
                poll_interval_secs: env_parse(
                    "CASTLINE_POLL_INTERVAL_SECS",
                    defaults.scheduler.poll_interval_secs,
                ),
                ..defaults.scheduler
            },
            resilience: ResilienceConfig {
                max_attempts: env_parse("CASTLINE_MAX_ATTEMPTS", defaults.resilience.max_attempts),
                failure_threshold: env_parse(
                    "CASTLINE_BREAKER_THRESHOLD",
                    defaults.resilience.failure_threshold,
                ),
                cooldown_secs: env_parse(
                    "CASTLINE_BREAKER_COOLDOWN_SECS",
                    defaults.resilience.cooldown_secs,
                ),
                ..defaults.resilience
            },
            idempotency: IdempotencyConfig {
                ttl_secs: env_parse("CASTLINE_IDEMPOTENCY_TTL_SECS", defaults.idempotency.ttl_secs),
                ..defaults.idempotency
            },
            media: MediaConfig {
                webhook_secret: std::env::var("CASTLINE_MEDIA_WEBHOOK_SECRET").ok(),
                stream_base_url: std::env::var("CASTLINE_STREAM_BASE_URL")
                    .unwrap_or(defaults.media.stream_base_url),
                image_base_url: std::env::var("CASTLINE_IMAGE_BASE_URL")
                    .unwrap_or(defaults.media.image_base_url),
                provider_api_url: std::env::var("CASTLINE_MEDIA_PROVIDER_URL").ok(),
                provider_token: std::env::var("CASTLINE_MEDIA_PROVIDER_TOKEN").ok(),
            },
            upstream: UpstreamConfig {
                base_url: std::env::var("CASTLINE_UPSTREAM_URL")
                    .unwrap_or(defaults.upstream.base_url),
                default_credential: std::env::var("CASTLINE_UPSTREAM_TOKEN").ok(),
                ..defaults.upstream
            },
            storage: StorageConfig {
                backend: storage_backend,
                sqlite_path: std::env::var("CASTLINE_SQLITE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.sqlite_path),
            },
            shared_state: SharedStateConfig {
                backend: state_backend,
                redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.shared_state.redis_url),
                pool_size: env_parse("REDIS_POOL_SIZE", defaults.shared_state.pool_size),
                key_prefix: std::env::var("CASTLINE_KEY_PREFIX")
                    .unwrap_or(defaults.shared_state.key_prefix),
            },
            logging: LoggingConfig {
                level: std::env::var("CASTLINE_LOG_LEVEL").unwrap_or(defaults.logging.level),
                format: std::env::var("CASTLINE_LOG_FORMAT").unwrap_or(defaults.logging.format),
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.bind_address()?;

        let scheduler = &self.scheduler;
        if scheduler.max_items == 0 {
            anyhow::bail!("scheduler.max_items must be greater than 0");
        }
        if scheduler.max_duration_secs == 0 {
            anyhow::bail!("scheduler.max_duration_secs must be greater than 0");
        }
        if scheduler.per_call_timeout_secs == 0 {
            anyhow::bail!("scheduler.per_call_timeout_secs must be greater than 0");
        }
        if scheduler.retry_multiplier < 1.0 {
            anyhow::bail!("scheduler.retry_multiplier must be at least 1.0");
        }
        if scheduler.retry_base_delay_secs > scheduler.retry_max_delay_secs {
            anyhow::bail!("scheduler.retry_base_delay_secs must not exceed retry_max_delay_secs");
        }

        let resilience = &self.resilience;
        if resilience.max_attempts == 0 {
            anyhow::bail!("resilience.max_attempts must be greater than 0");
        }
        if resilience.failure_threshold == 0 {
            anyhow::bail!("resilience.failure_threshold must be greater than 0");
        }
        if resilience.backoff_multiplier < 1.0 {
            anyhow::bail!("resilience.backoff_multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&resilience.jitter_ratio) {
            anyhow::bail!("resilience.jitter_ratio must be within 0.0..=1.0");
        }

        // A run that outlives its lease lets a second run in.
        let required = self.run_budget() + self.worst_case_item_duration();
        if self.lock_ttl() <= required {
            anyhow::bail!(
                "scheduler.lock_ttl_secs ({}s) must exceed max_duration_secs plus the worst-case item duration ({}s)",
                scheduler.lock_ttl_secs,
                required.as_secs_f64()
            );
        }

        if self.idempotency.ttl_secs == 0 || self.idempotency.reservation_ttl_secs == 0 {
            anyhow::bail!("idempotency TTLs must be greater than 0");
        }

        // Publish-now runs outside the lease; an in-flight call must keep both
        // its `publishing` claim and its reservation until it returns.
        let item_worst_case = self.worst_case_item_duration();
        if Duration::from_secs(scheduler.stale_publishing_secs) <= item_worst_case {
            anyhow::bail!(
                "scheduler.stale_publishing_secs ({}s) must exceed the worst-case item duration ({}s)",
                scheduler.stale_publishing_secs,
                item_worst_case.as_secs_f64()
            );
        }
        if Duration::from_secs(self.idempotency.reservation_ttl_secs) <= item_worst_case {
            anyhow::bail!(
                "idempotency.reservation_ttl_secs ({}s) must exceed the worst-case item duration ({}s)",
                self.idempotency.reservation_ttl_secs,
                item_worst_case.as_secs_f64()
            );
        }

        if self.shared_state.backend == StateBackend::Redis && self.shared_state.pool_size == 0 {
            anyhow::bail!("shared_state.pool_size must be greater than 0");
        }
        if self.shared_state.backend == StateBackend::Sqlite
            && self.storage.backend != StorageBackend::Sqlite
        {
            anyhow::bail!("shared_state.backend = sqlite requires storage.backend = sqlite");
        }

        Ok(())
    }

    /// Parsed bind address
    pub fn bind_address(&self) -> Result<SocketAddr> {
        self.server
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind_address))
    }

    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.scheduler.lock_ttl_secs)
    }

    #[must_use]
    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.scheduler.max_duration_secs)
    }

    #[must_use]
    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.per_call_timeout_secs)
    }

    /// Upper bound on one item's resilient call: every attempt timing out
    /// plus every inter-attempt delay at maximum jitter
    #[must_use]
    pub fn worst_case_item_duration(&self) -> Duration {
        let resilience = &self.resilience;
        let attempts = resilience.max_attempts.max(1);
        let mut total = self.per_call_timeout() * attempts;

        for attempt in 1..attempts {
            let exponential = resilience.base_delay_ms as f64
                * resilience.backoff_multiplier.powi(attempt as i32 - 1);
            let capped = exponential.min(resilience.max_delay_ms as f64);
            let with_jitter = capped * (1.0 + resilience.jitter_ratio);
            total += Duration::from_millis(with_jitter as u64);
        }

        total
    }
}
