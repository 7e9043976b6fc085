//! castline - scheduled publish pipeline for social posts
//!
//! Items are written ahead of time and published to an upstream social API
//! when they come due. A periodically triggered job does the publishing under
//! a distributed lock, every outbound call goes through retry and a
//! per-endpoint circuit breaker, and outcomes are recorded under idempotency
//! keys so retried requests replay instead of double-publishing.
//!
//! # Architecture
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Items, runs, media records and idempotency records
//! - [`storage`] - Record persistence (SQLite, in-memory)
//! - [`lock`] - Leased distributed lock
//! - [`idempotency`] - Recorded outcomes with atomic reservation
//! - [`resilience`] - Backoff, retry and circuit breaker
//! - [`shared`] - Redis backend for lock, idempotency and breaker state
//! - [`publish`] - Upstream publish call
//! - [`scheduler`] - Due-cast run, per-item pipeline and recovery
//! - [`media`] - Transcoding status webhooks and delivery URLs
//! - [`server`] - HTTP trigger, webhook and management API
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use castline::app::App;
//! use castline::config::Config;
//! use castline::scheduler::RunRequest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let app = App::from_config(config).await?;
//!     let request = RunRequest::from_config("manual", &app.config.scheduler);
//!     let report = app.scheduler.run(request).await;
//!     println!("published {}", report.counts.published);
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod clock;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod lock;
pub mod media;
pub mod metrics;
pub mod models;
pub mod publish;
pub mod resilience;
pub mod scheduler;
pub mod server;
pub mod shared;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::app::App;
    pub use crate::config::Config;
    pub use crate::error::{CastlineErrorTrait, ErrorCategory};
    pub use crate::models::{CronRun, ItemStatus, MediaRecord, ScheduledItem, VideoStatus};
    pub use crate::scheduler::{DueCastScheduler, RunReport, RunRequest};
}

pub use models::{CronRun, ItemStatus, ScheduledItem};
