//! Due-cast scheduling
//!
//! # Overview
//!
//! A periodically invoked job selects due items and publishes them to the
//! upstream under a distributed lock, so overlapping triggers never
//! double-publish. Each item goes through the same per-item path whether it is
//! picked up by a run or published on demand.
//!
//! # Modules
//!
//! - [`runner`] - lock-guarded run with CronRun bookkeeping and a soft deadline
//! - [`pipeline`] - per-item reserve, claim, publish and outcome recording
//! - [`recovery`] - stale `publishing` items and abandoned runs
//! - [`trigger`] - optional internal interval trigger
//! - [`error`] - scheduler error types
//!
//! # Quick Start
//!
//! ```ignore
//! use castline::scheduler::RunRequest;
//!
//! let report = scheduler.run(RunRequest::from_config("manual", &config.scheduler)).await;
//! if report.skipped {
//!     println!("another run is active");
//! }
//! ```

pub mod error;
pub mod pipeline;
pub mod recovery;
pub mod runner;
pub mod trigger;

pub use error::{SchedulerError, SchedulerResult};
pub use pipeline::{ItemOutcome, PipelineSettings, PublishPipeline, SkipReason};
pub use recovery::{close_abandoned_runs, reclaim_stale_items};
pub use runner::{DueCastScheduler, RunReport, RunRequest};
pub use trigger::{IntervalTrigger, TriggerConfig, INTERVAL_SOURCE};
