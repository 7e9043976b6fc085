//! Injectable time sources
//!
//! Every component that reasons about time (lock expiry, breaker cooldown,
//! backoff scheduling, run deadlines, idempotency expiry) reads it through
//! [`Clock`], and every component that waits does so through [`Sleeper`].
//! Production code uses [`SystemClock`] and [`TokioSleeper`]; tests use
//! [`ManualClock`], which implements both and advances itself when asked to
//! sleep, so retry loops run without real time passing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of the current instant
pub trait Clock: Send + Sync {
    /// Current time in UTC
    fn now(&self) -> DateTime<Utc>;
}

/// Something that can wait for a duration
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Sleeps on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually driven clock for tests
///
/// Sleeping on a `ManualClock` advances it by the requested duration and
/// records the request, so callers can assert on the backoff schedule.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += to_chrono(by);
        }
    }

    /// Jump to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }

    /// Durations requested through [`Sleeper::sleep`], in order
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|p| *p.into_inner())
    }
}

#[async_trait]
impl Sleeper for ManualClock {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
    }
}

/// Convert a std duration to a chrono duration, saturating at ten years
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    const TEN_YEARS_MS: u128 = 10 * 365 * 24 * 60 * 60 * 1000;
    let ms = duration.as_millis().min(TEN_YEARS_MS) as i64;
    chrono::Duration::milliseconds(ms)
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Shared sleeper handle
pub type SharedSleeper = Arc<dyn Sleeper>;
