//! SQLite backend
//!
//! One connection behind a `Mutex`, WAL journal, schema created on open.
//! Instants are stored as epoch milliseconds so due-selection and expiry
//! checks are plain integer comparisons.
//!
//! Besides the record repositories, the store implements the shared-state
//! traits ([`DistributedLock`], [`IdempotencyStore`], [`BreakerStore`]) for
//! deployments that share one database file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{CronRunRepository, ItemRepository, MediaRepository};
use crate::clock::{to_chrono, SharedClock};
use crate::idempotency::{IdempotencyStore, Lookup, RecordOutcome};
use crate::lock::{new_owner_token, AcquireOutcome, DistributedLock, LockGrant};
use crate::models::{
    CronRun, IdempotencyRecord, ItemStatus, MediaKind, MediaRecord, RunCounts, ScheduledItem,
    VideoStatus,
};
use crate::resilience::{BreakerStore, CircuitBreakerState};

const ITEM_COLUMNS: &str = "id, owner_ref, payload, status, scheduled_at, published_at, \
     external_ref, error_message, retry_count, claimed_at, updated_at";

const RUN_COLUMNS: &str = "id, job_name, source, started_at, finished_at, success, \
     published, failed, retrying, skipped, processed, error_message";

const MEDIA_COLUMNS: &str =
    "id, provider_ref, kind, video_status, playable_url, thumbnail_url";

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).with_context(|| format!("Timestamp out of range: {ms}"))
}

fn from_millis_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

/// SQLite implementation of every repository and shared-state trait
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: SharedClock,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>, clock: SharedClock) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self {
            conn: Mutex::new(conn),
            clock,
        };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite store initialized");
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory(clock: SharedClock) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to create in-memory SQLite")?;
        let store = Self {
            conn: Mutex::new(conn),
            clock,
        };
        store.create_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("SQLite connection mutex poisoned: {e}"))
    }

    /// Create database schema
    fn create_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS scheduled_items (
                    id TEXT PRIMARY KEY,
                    owner_ref TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL,
                    scheduled_at INTEGER NOT NULL,
                    published_at INTEGER,
                    external_ref TEXT,
                    error_message TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    claimed_at INTEGER,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_scheduled_items_due
                    ON scheduled_items(status, scheduled_at);

                CREATE TABLE IF NOT EXISTS cron_runs (
                    id TEXT PRIMARY KEY,
                    job_name TEXT NOT NULL,
                    source TEXT NOT NULL,
                    started_at INTEGER NOT NULL,
                    finished_at INTEGER,
                    success INTEGER NOT NULL DEFAULT 0,
                    published INTEGER NOT NULL DEFAULT 0,
                    failed INTEGER NOT NULL DEFAULT 0,
                    retrying INTEGER NOT NULL DEFAULT 0,
                    skipped INTEGER NOT NULL DEFAULT 0,
                    processed INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_cron_runs_job
                    ON cron_runs(job_name, started_at);

                CREATE TABLE IF NOT EXISTS media_records (
                    id TEXT PRIMARY KEY,
                    provider_ref TEXT NOT NULL UNIQUE,
                    kind TEXT NOT NULL,
                    video_status TEXT,
                    playable_url TEXT,
                    thumbnail_url TEXT
                );

                CREATE TABLE IF NOT EXISTS locks (
                    key TEXT PRIMARY KEY,
                    owner_token TEXT NOT NULL,
                    expires_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS idempotency_records (
                    key TEXT PRIMARY KEY,
                    status INTEGER,
                    data TEXT,
                    pending INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_idempotency_expires
                    ON idempotency_records(expires_at);

                CREATE TABLE IF NOT EXISTS circuit_breakers (
                    key TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    data TEXT NOT NULL
                );
                "#,
        )
        .context("Failed to create SQLite schema")?;

        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

struct RawItem {
    id: String,
    owner_ref: String,
    payload: String,
    status: String,
    scheduled_at: i64,
    published_at: Option<i64>,
    external_ref: Option<String>,
    error_message: Option<String>,
    retry_count: i64,
    claimed_at: Option<i64>,
    updated_at: i64,
}

impl RawItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_ref: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            scheduled_at: row.get(4)?,
            published_at: row.get(5)?,
            external_ref: row.get(6)?,
            error_message: row.get(7)?,
            retry_count: row.get(8)?,
            claimed_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_item(self) -> Result<ScheduledItem> {
        Ok(ScheduledItem {
            payload: serde_json::from_str(&self.payload)
                .with_context(|| format!("Corrupt payload for item {}", self.id))?,
            status: self
                .status
                .parse::<ItemStatus>()
                .map_err(anyhow::Error::msg)?,
            scheduled_at: from_millis(self.scheduled_at)?,
            published_at: from_millis_opt(self.published_at)?,
            external_ref: self.external_ref,
            error_message: self.error_message,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            claimed_at: from_millis_opt(self.claimed_at)?,
            updated_at: from_millis(self.updated_at)?,
            owner_ref: self.owner_ref,
            id: self.id,
        })
    }
}

struct RawRun {
    id: String,
    job_name: String,
    source: String,
    started_at: i64,
    finished_at: Option<i64>,
    success: bool,
    counts: [i64; 5],
    error_message: Option<String>,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_name: row.get(1)?,
            source: row.get(2)?,
            started_at: row.get(3)?,
            finished_at: row.get(4)?,
            success: row.get(5)?,
            counts: [row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?],
            error_message: row.get(11)?,
        })
    }

    fn into_run(self) -> Result<CronRun> {
        let count = |v: i64| u32::try_from(v).unwrap_or(0);
        Ok(CronRun {
            started_at: from_millis(self.started_at)?,
            finished_at: from_millis_opt(self.finished_at)?,
            success: self.success,
            counts: RunCounts {
                published: count(self.counts[0]),
                failed: count(self.counts[1]),
                retrying: count(self.counts[2]),
                skipped: count(self.counts[3]),
                processed: count(self.counts[4]),
            },
            error_message: self.error_message,
            id: self.id,
            job_name: self.job_name,
            source: self.source,
        })
    }
}

struct RawMedia {
    id: String,
    provider_ref: String,
    kind: String,
    video_status: Option<String>,
    playable_url: Option<String>,
    thumbnail_url: Option<String>,
}

impl RawMedia {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            provider_ref: row.get(1)?,
            kind: row.get(2)?,
            video_status: row.get(3)?,
            playable_url: row.get(4)?,
            thumbnail_url: row.get(5)?,
        })
    }

    fn into_media(self) -> Result<MediaRecord> {
        Ok(MediaRecord {
            kind: self.kind.parse::<MediaKind>().map_err(anyhow::Error::msg)?,
            video_status: self
                .video_status
                .map(|s| s.parse::<VideoStatus>().map_err(anyhow::Error::msg))
                .transpose()?,
            id: self.id,
            provider_ref: self.provider_ref,
            playable_url: self.playable_url,
            thumbnail_url: self.thumbnail_url,
        })
    }
}

// ============================================================================
// Items
// ============================================================================

#[async_trait]
impl ItemRepository for SqliteStore {
    async fn create_item(&self, item: &ScheduledItem) -> Result<()> {
        let payload = serde_json::to_string(&item.payload)?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO scheduled_items ({ITEM_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                item.id,
                item.owner_ref,
                payload,
                item.status.as_str(),
                millis(item.scheduled_at),
                item.published_at.map(millis),
                item.external_ref,
                item.error_message,
                item.retry_count,
                item.claimed_at.map(millis),
                millis(item.updated_at),
            ],
        )
        .with_context(|| format!("Failed to insert item {}", item.id))?;
        Ok(())
    }

    async fn get_item(&self, id: &str) -> Result<Option<ScheduledItem>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM scheduled_items WHERE id = ?1"),
                params![id],
                RawItem::from_row,
            )
            .optional()
            .context("Failed to load item")?;
        raw.map(RawItem::into_item).transpose()
    }

    async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM scheduled_items
                 WHERE status IN ('scheduled', 'retrying') AND scheduled_at <= ?1
                 ORDER BY scheduled_at ASC, id ASC
                 LIMIT ?2"
            ))
            .context("Failed to prepare due selection")?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let raws = stmt
            .query_map(params![millis(now), limit], RawItem::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to select due items")?;

        raws.into_iter().map(RawItem::into_item).collect()
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_items
                 SET status = 'publishing', claimed_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status IN ('draft', 'scheduled', 'retrying')",
                params![id, millis(now)],
            )
            .context("Failed to claim item")?;
        Ok(changed == 1)
    }

    async fn mark_published(
        &self,
        id: &str,
        external_ref: &str,
        published_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_items
                 SET status = 'published', external_ref = ?2, published_at = ?3,
                     error_message = NULL, claimed_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND status = 'publishing'",
                params![id, external_ref, millis(published_at)],
            )
            .context("Failed to mark item published")?;
        Ok(changed == 1)
    }

    async fn mark_retrying(
        &self,
        id: &str,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_items
                 SET status = 'retrying', retry_count = ?2, scheduled_at = ?3,
                     error_message = ?4, claimed_at = NULL, updated_at = ?5
                 WHERE id = ?1 AND status = 'publishing'",
                params![id, retry_count, millis(next_attempt_at), error, millis(now)],
            )
            .context("Failed to mark item retrying")?;
        Ok(changed == 1)
    }

    async fn mark_failed(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_items
                 SET status = 'failed', error_message = ?2, claimed_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND status = 'publishing'",
                params![id, error, millis(now)],
            )
            .context("Failed to mark item failed")?;
        Ok(changed == 1)
    }

    async fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "UPDATE scheduled_items
             SET status = 'retrying', scheduled_at = ?2, claimed_at = NULL, updated_at = ?2,
                 error_message = 'reclaimed after stale publishing claim'
             WHERE status = 'publishing' AND (claimed_at IS NULL OR claimed_at <= ?1)
             RETURNING id",
        )?;
        let mut ids = stmt
            .query_map(params![millis(stale_before), millis(now)], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to reclaim stale items")?;
        ids.sort();
        Ok(ids)
    }

    async fn reschedule(&self, id: &str, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_items
                 SET status = 'scheduled', scheduled_at = ?2, retry_count = 0,
                     error_message = NULL, claimed_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND status NOT IN ('publishing', 'published')",
                params![id, millis(at), millis(now)],
            )
            .context("Failed to reschedule item")?;
        Ok(changed == 1)
    }

    async fn delete_item(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "DELETE FROM scheduled_items WHERE id = ?1 AND status != 'publishing'",
                params![id],
            )
            .context("Failed to delete item")?;
        Ok(changed == 1)
    }
}

// ============================================================================
// Cron runs
// ============================================================================

#[async_trait]
impl CronRunRepository for SqliteStore {
    async fn start_run(&self, run: &CronRun) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cron_runs (id, job_name, source, started_at, success)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![run.id, run.job_name, run.source, millis(run.started_at)],
        )
        .context("Failed to insert cron run")?;
        Ok(())
    }

    async fn finish_run(
        &self,
        id: &str,
        finished_at: DateTime<Utc>,
        success: bool,
        counts: &RunCounts,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE cron_runs
                 SET finished_at = ?2, success = ?3, published = ?4, failed = ?5,
                     retrying = ?6, skipped = ?7, processed = ?8, error_message = ?9
                 WHERE id = ?1 AND finished_at IS NULL",
                params![
                    id,
                    millis(finished_at),
                    success,
                    counts.published,
                    counts.failed,
                    counts.retrying,
                    counts.skipped,
                    counts.processed,
                    error,
                ],
            )
            .context("Failed to finalize cron run")?;
        Ok(changed == 1)
    }

    async fn get_run(&self, id: &str) -> Result<Option<CronRun>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM cron_runs WHERE id = ?1"),
                params![id],
                RawRun::from_row,
            )
            .optional()
            .context("Failed to load cron run")?;
        raw.map(RawRun::into_run).transpose()
    }

    async fn open_runs(&self, job_name: &str) -> Result<Vec<CronRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM cron_runs
             WHERE job_name = ?1 AND finished_at IS NULL
             ORDER BY started_at ASC"
        ))?;
        let raws = stmt
            .query_map(params![job_name], RawRun::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list open cron runs")?;
        raws.into_iter().map(RawRun::into_run).collect()
    }

    async fn recent_runs(&self, job_name: &str, limit: usize) -> Result<Vec<CronRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM cron_runs
             WHERE job_name = ?1
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let raws = stmt
            .query_map(params![job_name, limit], RawRun::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list cron runs")?;
        raws.into_iter().map(RawRun::into_run).collect()
    }
}

// ============================================================================
// Media
// ============================================================================

#[async_trait]
impl MediaRepository for SqliteStore {
    async fn insert_media(&self, media: &MediaRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT INTO media_records ({MEDIA_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                media.id,
                media.provider_ref,
                media.kind.as_str(),
                media.video_status.map(|s| s.as_str()),
                media.playable_url,
                media.thumbnail_url,
            ],
        )
        .with_context(|| format!("Failed to insert media {}", media.id))?;
        Ok(())
    }

    async fn get_media(&self, id: &str) -> Result<Option<MediaRecord>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {MEDIA_COLUMNS} FROM media_records WHERE id = ?1"),
                params![id],
                RawMedia::from_row,
            )
            .optional()
            .context("Failed to load media")?;
        raw.map(RawMedia::into_media).transpose()
    }

    async fn find_media_by_provider_ref(&self, provider_ref: &str) -> Result<Option<MediaRecord>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {MEDIA_COLUMNS} FROM media_records WHERE provider_ref = ?1"),
                params![provider_ref],
                RawMedia::from_row,
            )
            .optional()
            .context("Failed to look up media by provider ref")?;
        raw.map(RawMedia::into_media).transpose()
    }

    async fn advance_video_status(
        &self,
        id: &str,
        expected: Option<VideoStatus>,
        next: VideoStatus,
        playable_url: Option<&str>,
        thumbnail_url: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE media_records
                 SET video_status = ?3,
                     playable_url = COALESCE(?4, playable_url),
                     thumbnail_url = COALESCE(?5, thumbnail_url)
                 WHERE id = ?1 AND video_status IS ?2",
                params![
                    id,
                    expected.map(|s| s.as_str()),
                    next.as_str(),
                    playable_url,
                    thumbnail_url,
                ],
            )
            .context("Failed to advance media status")?;
        Ok(changed == 1)
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[async_trait]
impl DistributedLock for SqliteStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<AcquireOutcome> {
        let now = self.clock.now();
        let grant = LockGrant {
            key: key.to_string(),
            owner_token: new_owner_token(),
            expires_at: now + to_chrono(ttl),
        };

        let conn = self.conn()?;
        // Insert, or take over a record whose lease has run out, in one statement
        let changed = conn
            .execute(
                "INSERT INTO locks (key, owner_token, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE
                 SET owner_token = excluded.owner_token, expires_at = excluded.expires_at
                 WHERE locks.expires_at <= ?4",
                params![key, grant.owner_token, millis(grant.expires_at), millis(now)],
            )
            .context("Failed to acquire lock")?;

        Ok(if changed == 1 {
            AcquireOutcome::Granted(grant)
        } else {
            AcquireOutcome::Denied
        })
    }

    async fn release(&self, key: &str, owner_token: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "DELETE FROM locks WHERE key = ?1 AND owner_token = ?2",
                params![key, owner_token],
            )
            .context("Failed to release lock")?;
        Ok(changed == 1)
    }
}

#[async_trait]
impl IdempotencyStore for SqliteStore {
    async fn get_or_reserve(&self, key: &str, reservation_ttl: Duration) -> Result<Lookup> {
        let now = self.clock.now();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM idempotency_records WHERE expires_at <= ?1",
            params![millis(now)],
        )
        .context("Failed to purge expired idempotency records")?;

        let reserved = tx.execute(
            "INSERT INTO idempotency_records (key, status, data, pending, expires_at)
             VALUES (?1, NULL, NULL, 1, ?2)
             ON CONFLICT(key) DO UPDATE
             SET status = NULL, data = NULL, pending = 1, expires_at = excluded.expires_at
             WHERE idempotency_records.expires_at <= ?3",
            params![key, millis(now + to_chrono(reservation_ttl)), millis(now)],
        )?;

        let lookup = if reserved == 1 {
            Lookup::Reserved
        } else {
            let (status, data, pending, expires_at): (Option<u16>, Option<String>, bool, i64) = tx
                .query_row(
                    "SELECT status, data, pending, expires_at FROM idempotency_records WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;
            if pending {
                Lookup::InProgress
            } else {
                Lookup::Found(IdempotencyRecord {
                    key: key.to_string(),
                    status: status.unwrap_or(200),
                    data: data.unwrap_or_default(),
                    expires_at: from_millis(expires_at)?,
                })
            }
        };

        tx.commit()?;
        Ok(lookup)
    }

    async fn record(
        &self,
        key: &str,
        status: u16,
        data: &str,
        ttl: Duration,
    ) -> Result<RecordOutcome> {
        let now = self.clock.now();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored = tx.execute(
            "INSERT INTO idempotency_records (key, status, data, pending, expires_at)
             VALUES (?1, ?2, ?3, 0, ?4)
             ON CONFLICT(key) DO UPDATE
             SET status = excluded.status, data = excluded.data, pending = 0,
                 expires_at = excluded.expires_at
             WHERE idempotency_records.pending = 1 OR idempotency_records.expires_at <= ?5",
            params![key, status, data, millis(now + to_chrono(ttl)), millis(now)],
        )?;

        let outcome = if stored == 1 {
            RecordOutcome::Stored
        } else {
            let (status, data, expires_at): (Option<u16>, Option<String>, i64) = tx.query_row(
                "SELECT status, data, expires_at FROM idempotency_records WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            RecordOutcome::AlreadyRecorded(IdempotencyRecord {
                key: key.to_string(),
                status: status.unwrap_or(200),
                data: data.unwrap_or_default(),
                expires_at: from_millis(expires_at)?,
            })
        };

        tx.commit()?;
        Ok(outcome)
    }

    async fn release(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM idempotency_records WHERE key = ?1 AND pending = 1",
            params![key],
        )
        .context("Failed to release idempotency reservation")?;
        Ok(())
    }
}

#[async_trait]
impl BreakerStore for SqliteStore {
    async fn load(&self, key: &str) -> Result<Option<CircuitBreakerState>> {
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM circuit_breakers WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).context("Corrupt breaker state"))
            .transpose()
    }

    async fn save(&self, state: &CircuitBreakerState) -> Result<()> {
        let data = serde_json::to_string(state)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO circuit_breakers (key, state, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET state = excluded.state, data = excluded.data",
            params![state.key, state.state.as_str(), data],
        )
        .context("Failed to save breaker state")?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CircuitBreakerState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT data FROM circuit_breakers ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter()
            .map(|d| serde_json::from_str(d).context("Corrupt breaker state"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resilience::CircuitState;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store() -> (SqliteStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap());
        (SqliteStore::in_memory(Arc::new(clock.clone())).unwrap(), clock)
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("castline.db");
        let clock = Arc::new(crate::clock::SystemClock);
        assert!(SqliteStore::open(&path, clock).is_ok());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_lock_upsert_respects_expiry() {
        let (store, clock) = store();

        let AcquireOutcome::Granted(first) =
            store.acquire("job", Duration::from_secs(30)).await.unwrap()
        else {
            panic!("expected grant");
        };
        assert_eq!(
            store.acquire("job", Duration::from_secs(30)).await.unwrap(),
            AcquireOutcome::Denied
        );

        clock.advance(Duration::from_secs(30));
        let second = store.acquire("job", Duration::from_secs(30)).await.unwrap();
        assert!(second.is_granted());

        // Stale holder's release is a no-op
        assert!(!DistributedLock::release(&store, "job", &first.owner_token).await.unwrap());
        assert_eq!(
            store.acquire("job", Duration::from_secs(30)).await.unwrap(),
            AcquireOutcome::Denied
        );
    }

    #[tokio::test]
    async fn test_lock_shared_between_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db");
        let clock: SharedClock = Arc::new(crate::clock::SystemClock);

        let a = SqliteStore::open(&path, clock.clone()).unwrap();
        let b = SqliteStore::open(&path, clock).unwrap();

        assert!(a.acquire("job", Duration::from_secs(60)).await.unwrap().is_granted());
        assert!(!b.acquire("job", Duration::from_secs(60)).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_idempotency_first_write_wins() {
        let (store, _clock) = store();
        let ttl = Duration::from_secs(3600);
        let reserve = Duration::from_secs(60);

        assert_eq!(store.get_or_reserve("k", reserve).await.unwrap(), Lookup::Reserved);
        assert_eq!(store.get_or_reserve("k", reserve).await.unwrap(), Lookup::InProgress);

        assert_eq!(
            store.record("k", 201, "first", ttl).await.unwrap(),
            RecordOutcome::Stored
        );
        assert!(matches!(
            store.record("k", 500, "second", ttl).await.unwrap(),
            RecordOutcome::AlreadyRecorded(ref r) if r.data == "first"
        ));

        let Lookup::Found(record) = store.get_or_reserve("k", reserve).await.unwrap() else {
            panic!("expected record");
        };
        assert_eq!(record.status, 201);
        assert_eq!(record.data, "first");
    }

    #[tokio::test]
    async fn test_idempotency_expiry_and_release() {
        let (store, clock) = store();
        let reserve = Duration::from_secs(60);

        store.get_or_reserve("k", reserve).await.unwrap();
        IdempotencyStore::release(&store, "k").await.unwrap();
        assert_eq!(store.get_or_reserve("k", reserve).await.unwrap(), Lookup::Reserved);

        store.record("k", 200, "ok", Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get_or_reserve("k", reserve).await.unwrap(), Lookup::Reserved);
    }

    #[tokio::test]
    async fn test_idempotency_expired_rows_are_purged() {
        let (store, clock) = store();
        let reserve = Duration::from_secs(60);

        store.record("old", 200, "ok", Duration::from_secs(10)).await.unwrap();
        store.get_or_reserve("abandoned", Duration::from_secs(10)).await.unwrap();
        store.record("fresh", 200, "ok", Duration::from_secs(3600)).await.unwrap();

        clock.advance(Duration::from_secs(11));
        store.get_or_reserve("next", reserve).await.unwrap();

        let keys: Vec<String> = {
            let conn = store.conn().unwrap();
            let mut stmt = conn
                .prepare("SELECT key FROM idempotency_records ORDER BY key")
                .unwrap();
            let rows = stmt.query_map([], |row| row.get(0)).unwrap();
            rows.collect::<rusqlite::Result<_>>().unwrap()
        };
        assert_eq!(keys, vec!["fresh".to_string(), "next".to_string()]);
    }

    #[tokio::test]
    async fn test_breaker_state_round_trip() {
        let (store, _clock) = store();
        let mut state = CircuitBreakerState::closed("upstream:publish");
        state.state = CircuitState::Open;
        state.consecutive_failures = 5;

        store.save(&state).await.unwrap();
        assert_eq!(store.load("upstream:publish").await.unwrap(), Some(state.clone()));
        assert_eq!(store.list().await.unwrap(), vec![state]);
        assert_eq!(store.load("other").await.unwrap(), None);
    }
}
