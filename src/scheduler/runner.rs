//! Due-cast scheduler run
//!
//! One invocation of [`DueCastScheduler::run`]:
//!
//! ```text
//! acquire lock ──denied──▶ skipped report (no work)
//!      │ granted
//!      ▼
//! start CronRun ─▶ close abandoned runs ─▶ reclaim stale items
//!      ─▶ select due (oldest first, ≤ max_items)
//!      ─▶ process items sequentially until the soft deadline
//!      ─▶ finalize CronRun (always, even after a panic) ─▶ release lock
//! ```
//!
//! Lock store failures fail closed: nothing is processed and the report is
//! `skipped` with `success = false`.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::error::{SchedulerError, SchedulerResult};
use super::pipeline::{ItemOutcome, PublishPipeline};
use super::recovery;
use crate::clock::{to_chrono, SharedClock};
use crate::config::SchedulerConfig;
use crate::lock::{AcquireOutcome, DistributedLock};
use crate::models::{CronRun, RunCounts};
use crate::storage::{SharedCronRunRepository, SharedItemRepository};

/// Parameters of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Who triggered the run (`cron`, `manual`, `interval`, ...)
    pub source: String,
    pub max_items: usize,
    /// Soft deadline, checked between items
    pub max_duration: Duration,
    pub per_call_timeout: Duration,
}

impl RunRequest {
    pub fn from_config(source: impl Into<String>, config: &SchedulerConfig) -> Self {
        Self {
            source: source.into(),
            max_items: config.max_items,
            max_duration: Duration::from_secs(config.max_duration_secs),
            per_call_timeout: Duration::from_secs(config.per_call_timeout_secs),
        }
    }
}

/// Result of one invocation, returned to the trigger caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// `None` when no CronRun was started
    pub run_id: Option<String>,
    pub job_name: String,
    pub source: String,
    /// The run did no item work (lock denied or lock store down)
    pub skipped: bool,
    pub success: bool,
    pub counts: RunCounts,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    fn outcome_label(&self) -> &'static str {
        match (self.skipped, self.success) {
            (true, true) => "skipped",
            (_, false) => "failed",
            (false, true) => "success",
        }
    }
}

/// Lease-guarded scheduler of due items
pub struct DueCastScheduler {
    lock: Arc<dyn DistributedLock>,
    items: SharedItemRepository,
    runs: SharedCronRunRepository,
    pipeline: Arc<PublishPipeline>,
    clock: SharedClock,
    job_name: String,
    lock_key: String,
    lock_ttl: Duration,
    stale_after: Duration,
}

impl DueCastScheduler {
    pub fn new(
        lock: Arc<dyn DistributedLock>,
        items: SharedItemRepository,
        runs: SharedCronRunRepository,
        pipeline: Arc<PublishPipeline>,
        clock: SharedClock,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            lock,
            items,
            runs,
            pipeline,
            clock,
            job_name: config.job_name.clone(),
            lock_key: config.lock_key.clone(),
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            stale_after: Duration::from_secs(config.stale_publishing_secs),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn pipeline(&self) -> &Arc<PublishPipeline> {
        &self.pipeline
    }

    /// Perform one scheduler pass
    #[instrument(skip(self, request), fields(source = %request.source))]
    pub async fn run(&self, request: RunRequest) -> RunReport {
        let started_at = self.clock.now();

        let grant = match self.lock.acquire(&self.lock_key, self.lock_ttl).await {
            Ok(AcquireOutcome::Granted(grant)) => grant,
            Ok(AcquireOutcome::Denied) => {
                info!(lock_key = %self.lock_key, "Another run holds the lock, skipping");
                return self.finish_report(
                    self.skipped_report(&request, started_at, true, None),
                    None,
                );
            }
            Err(e) => {
                let err = SchedulerError::lock_store("acquire", format!("{e:#}"));
                error!(error = %err, "Lock store unavailable, run not started");
                self.record_failed_run(&request, started_at, &err).await;
                return self.finish_report(
                    self.skipped_report(&request, started_at, false, Some(err.to_string())),
                    None,
                );
            }
        };

        let run = CronRun {
            id: uuid::Uuid::new_v4().to_string(),
            job_name: self.job_name.clone(),
            source: request.source.clone(),
            started_at,
            finished_at: None,
            success: false,
            counts: RunCounts::default(),
            error_message: None,
        };

        let mut counts = RunCounts::default();
        let (started, result) = match self.runs.start_run(&run).await {
            Ok(()) => {
                info!(run_id = %run.id, "Scheduler run started");
                let result = AssertUnwindSafe(self.execute(&run.id, &request, &mut counts))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(SchedulerError::RunPanicked {
                            reason: panic_message(panic.as_ref()),
                        })
                    });
                (true, result)
            }
            Err(e) => (false, Err(SchedulerError::storage("start run", format!("{e:#}")))),
        };

        let finished_at = self.clock.now();
        let error = result.as_ref().err().map(ToString::to_string);

        if started {
            match self
                .runs
                .finish_run(&run.id, finished_at, result.is_ok(), &counts, error.as_deref())
                .await
            {
                Ok(true) => {}
                Ok(false) => warn!(run_id = %run.id, "Run was already finalized"),
                Err(e) => error!(run_id = %run.id, error = %format!("{e:#}"), "Failed to finalize run"),
            }
        }

        match self.lock.release(&self.lock_key, &grant.owner_token).await {
            Ok(true) => {}
            Ok(false) => warn!(lock_key = %self.lock_key, "Lock expired before release"),
            Err(e) => warn!(error = %format!("{e:#}"), "Failed to release lock; it will expire"),
        }

        match &error {
            None => info!(
                run_id = %run.id,
                published = counts.published,
                retrying = counts.retrying,
                failed = counts.failed,
                skipped = counts.skipped,
                "Scheduler run finished"
            ),
            Some(err) => error!(run_id = %run.id, error = %err, "Scheduler run failed"),
        }

        let report = RunReport {
            run_id: started.then(|| run.id.clone()),
            job_name: self.job_name.clone(),
            source: request.source,
            skipped: false,
            success: error.is_none(),
            counts,
            error,
            started_at,
            finished_at,
        };
        let elapsed = (finished_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.finish_report(report, Some(elapsed))
    }

    /// Body of a locked run
    async fn execute(
        &self,
        run_id: &str,
        request: &RunRequest,
        counts: &mut RunCounts,
    ) -> SchedulerResult<()> {
        let started = self.clock.now();
        let deadline = started + to_chrono(request.max_duration);

        recovery::close_abandoned_runs(&*self.runs, &*self.clock, &self.job_name, run_id).await?;
        recovery::reclaim_stale_items(&*self.items, &*self.clock, self.stale_after).await?;

        let due = self
            .items
            .select_due(self.clock.now(), request.max_items)
            .await
            .map_err(|e| SchedulerError::storage("select due items", format!("{e:#}")))?;

        info!(run_id, due = due.len(), "Selected due items");

        for (index, item) in due.iter().enumerate() {
            if self.clock.now() >= deadline {
                let remaining = (due.len() - index) as u32;
                counts.skipped += remaining;
                warn!(run_id, remaining, "Run budget exhausted, leaving items for the next run");
                break;
            }

            let outcome = self.pipeline.process(item, request.per_call_timeout).await?;
            match outcome {
                ItemOutcome::Published { .. } => counts.published += 1,
                ItemOutcome::Retrying { .. } => counts.retrying += 1,
                ItemOutcome::Failed { .. } => counts.failed += 1,
                ItemOutcome::Skipped { .. } => {
                    counts.skipped += 1;
                    continue;
                }
            }
            counts.processed += 1;
        }

        Ok(())
    }

    fn skipped_report(
        &self,
        request: &RunRequest,
        started_at: DateTime<Utc>,
        success: bool,
        error: Option<String>,
    ) -> RunReport {
        RunReport {
            run_id: None,
            job_name: self.job_name.clone(),
            source: request.source.clone(),
            skipped: true,
            success,
            counts: RunCounts::default(),
            error,
            started_at,
            finished_at: self.clock.now(),
        }
    }

    fn finish_report(&self, report: RunReport, duration_secs: Option<f64>) -> RunReport {
        crate::metrics::record_run(
            &report.source,
            report.outcome_label(),
            &report.counts,
            duration_secs,
        );
        report
    }

    /// Best-effort failed CronRun when the run could not start
    async fn record_failed_run(
        &self,
        request: &RunRequest,
        started_at: DateTime<Utc>,
        err: &SchedulerError,
    ) {
        let run = CronRun {
            id: uuid::Uuid::new_v4().to_string(),
            job_name: self.job_name.clone(),
            source: request.source.clone(),
            started_at,
            finished_at: Some(self.clock.now()),
            success: false,
            counts: RunCounts::default(),
            error_message: Some(err.to_string()),
        };
        if let Err(e) = self.runs.start_run(&run).await {
            warn!(error = %format!("{e:#}"), "Could not record failed run");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
