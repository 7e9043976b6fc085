//! Internal interval trigger
//!
//! When `scheduler.poll_interval_secs > 0` the server runs the scheduler on a
//! fixed interval with source `interval`. Each tick races for the scheduler
//! lock exactly like an external trigger, so overlapping with cron calls is
//! harmless.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::error::{SchedulerError, SchedulerResult};
use super::runner::{DueCastScheduler, RunReport, RunRequest};
use crate::config::SchedulerConfig;

/// Source tag recorded on runs started by the interval trigger
pub const INTERVAL_SOURCE: &str = "interval";

// ============================================================================
// Trigger Configuration
// ============================================================================

/// Configuration for the interval trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Time between ticks
    pub interval: Duration,

    /// Whether to fire once immediately on start
    pub trigger_on_startup: bool,
}

impl TriggerConfig {
    /// `None` when the interval trigger is disabled
    pub fn from_scheduler(config: &SchedulerConfig) -> Option<Self> {
        (config.poll_interval_secs > 0).then(|| Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            trigger_on_startup: true,
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.interval.is_zero() {
            return Err(SchedulerError::trigger_config(
                "interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Interval Trigger
// ============================================================================

/// Periodically invokes the scheduler until stopped
pub struct IntervalTrigger {
    config: TriggerConfig,
    scheduler: Arc<DueCastScheduler>,
    request: RunRequest,
    report_sender: broadcast::Sender<RunReport>,
    is_running: Arc<RwLock<bool>>,
}

impl IntervalTrigger {
    pub fn new(
        config: TriggerConfig,
        scheduler: Arc<DueCastScheduler>,
        scheduler_config: &SchedulerConfig,
    ) -> SchedulerResult<Self> {
        config.validate()?;

        let (report_sender, _) = broadcast::channel(16);

        Ok(Self {
            config,
            scheduler,
            request: RunRequest::from_config(INTERVAL_SOURCE, scheduler_config),
            report_sender,
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Subscribe to reports of interval-triggered runs
    pub fn subscribe(&self) -> broadcast::Receiver<RunReport> {
        self.report_sender.subscribe()
    }

    /// Start the trigger loop (runs until stopped)
    pub async fn start(&self) -> SchedulerResult<()> {
        *self.is_running.write().await = true;
        info!(interval_secs = self.config.interval.as_secs(), "Interval trigger started");

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        if !self.config.trigger_on_startup {
            // The first tick of a tokio interval completes immediately
            ticker.tick().await;
        }

        while *self.is_running.read().await {
            tokio::select! {
                _ = ticker.tick() => {
                    self.fire().await;
                }
                _ = self.wait_for_stop() => {
                    break;
                }
            }
        }

        info!("Interval trigger stopped");
        Ok(())
    }

    /// Stop the trigger loop
    pub async fn stop(&self) {
        *self.is_running.write().await = false;
    }

    /// Check if trigger is running
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    async fn wait_for_stop(&self) {
        loop {
            if !*self.is_running.read().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn fire(&self) {
        let report = self.scheduler.run(self.request.clone()).await;
        debug!(
            skipped = report.skipped,
            success = report.success,
            processed = report.counts.processed,
            "Interval run completed"
        );
        let _ = self.report_sender.send(report);
    }
}
