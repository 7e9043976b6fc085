//! Repository Pattern for the publish pipeline's records
//!
//! Trait-based repositories decouple the scheduler, the media state machine
//! and the HTTP surface from the storage backend:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Scheduler / Media state machine / API            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Repository Traits                         │
//! │   ItemRepository, CronRunRepository, MediaRepository        │
//! └─────────────────────────────────────────────────────────────┘
//!                   │                          │
//!                   ▼                          ▼
//!          ┌─────────────────┐        ┌─────────────────┐
//!          │   SqliteStore   │        │  InMemoryStore  │
//!          └─────────────────┘        └─────────────────┘
//! ```
//!
//! Every state change on an item is a conditional update keyed on the
//! status it expects, so two writers never both win the same transition.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::models::{CronRun, MediaRecord, RunCounts, ScheduledItem, VideoStatus};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

// ============================================================================
// Repository Traits
// ============================================================================

/// Storage of scheduled items
#[async_trait]
pub trait ItemRepository: Send + Sync {
    /// Insert a new item
    async fn create_item(&self, item: &ScheduledItem) -> Result<()>;

    /// Fetch an item by id
    async fn get_item(&self, id: &str) -> Result<Option<ScheduledItem>>;

    /// Up to `limit` items in `scheduled`/`retrying` with `scheduled_at <= now`,
    /// oldest first
    async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledItem>>;

    /// Move a claimable item to `publishing`; `false` if it was not claimable
    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// `publishing -> published`
    async fn mark_published(
        &self,
        id: &str,
        external_ref: &str,
        published_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// `publishing -> retrying` with the new retry count and due time
    async fn mark_retrying(
        &self,
        id: &str,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// `publishing -> failed`
    async fn mark_failed(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Move items claimed at or before `stale_before` back to `retrying`,
    /// due at `now`, keeping their retry count; returns the reclaimed ids
    async fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Reset a non-published, non-publishing item to `scheduled` at `at`
    ///
    /// The retry budget starts over.
    async fn reschedule(&self, id: &str, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool>;

    /// Delete an item that is not being published
    async fn delete_item(&self, id: &str) -> Result<bool>;
}

/// Storage of scheduler run records
#[async_trait]
pub trait CronRunRepository: Send + Sync {
    /// Insert an open run
    async fn start_run(&self, run: &CronRun) -> Result<()>;

    /// Finalize an open run; finalized runs are never changed again
    async fn finish_run(
        &self,
        id: &str,
        finished_at: DateTime<Utc>,
        success: bool,
        counts: &RunCounts,
        error: Option<&str>,
    ) -> Result<bool>;

    async fn get_run(&self, id: &str) -> Result<Option<CronRun>>;

    /// Runs of `job_name` that were never finalized
    async fn open_runs(&self, job_name: &str) -> Result<Vec<CronRun>>;

    /// Most recent runs of `job_name`, newest first
    async fn recent_runs(&self, job_name: &str, limit: usize) -> Result<Vec<CronRun>>;
}

/// Storage of media records
#[async_trait]
pub trait MediaRepository: Send + Sync {
    async fn insert_media(&self, media: &MediaRecord) -> Result<()>;

    async fn get_media(&self, id: &str) -> Result<Option<MediaRecord>>;

    async fn find_media_by_provider_ref(&self, provider_ref: &str) -> Result<Option<MediaRecord>>;

    /// Compare-and-set the video status; URLs are only overwritten when given
    async fn advance_video_status(
        &self,
        id: &str,
        expected: Option<VideoStatus>,
        next: VideoStatus,
        playable_url: Option<&str>,
        thumbnail_url: Option<&str>,
    ) -> Result<bool>;
}

// ============================================================================
// Shared Repository Types
// ============================================================================

pub type SharedItemRepository = Arc<dyn ItemRepository>;
pub type SharedCronRunRepository = Arc<dyn CronRunRepository>;
pub type SharedMediaRepository = Arc<dyn MediaRepository>;

/// The three record repositories, backed by one store
#[derive(Clone)]
pub struct Repositories {
    pub items: SharedItemRepository,
    pub runs: SharedCronRunRepository,
    pub media: SharedMediaRepository,
}

impl Repositories {
    /// Use one store for every repository
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ItemRepository + CronRunRepository + MediaRepository + 'static,
    {
        Self {
            items: store.clone(),
            runs: store.clone(),
            media: store,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
