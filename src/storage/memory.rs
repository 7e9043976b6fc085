//! In-memory backend for tests and single-process runs

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CronRunRepository, ItemRepository, MediaRepository};
use crate::models::{CronRun, ItemStatus, MediaRecord, RunCounts, ScheduledItem, VideoStatus};

#[derive(Default)]
struct Tables {
    items: HashMap<String, ScheduledItem>,
    /// Insertion order doubles as a tiebreaker for equal start times
    runs: Vec<CronRun>,
    media: HashMap<String, MediaRecord>,
}

/// In-memory implementation of the record repositories
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| anyhow::anyhow!("in-memory store poisoned: {e}"))
    }

    /// Number of stored items
    pub fn item_count(&self) -> usize {
        self.tables().map(|t| t.items.len()).unwrap_or(0)
    }

    /// Apply `update` to a `publishing` item; `false` if it is not publishing
    fn update_publishing(&self, id: &str, update: impl FnOnce(&mut ScheduledItem)) -> Result<bool> {
        let mut tables = self.tables()?;
        match tables.items.get_mut(id) {
            Some(item) if item.status == ItemStatus::Publishing => {
                update(item);
                item.claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ItemRepository for InMemoryStore {
    async fn create_item(&self, item: &ScheduledItem) -> Result<()> {
        let mut tables = self.tables()?;
        if tables.items.contains_key(&item.id) {
            anyhow::bail!("Item {} already exists", item.id);
        }
        tables.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn get_item(&self, id: &str) -> Result<Option<ScheduledItem>> {
        Ok(self.tables()?.items.get(id).cloned())
    }

    async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledItem>> {
        let tables = self.tables()?;
        let mut due: Vec<_> = tables
            .items
            .values()
            .filter(|item| item.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables()?;
        match tables.items.get_mut(id) {
            Some(item) if item.status.is_claimable() => {
                item.status = ItemStatus::Publishing;
                item.claimed_at = Some(now);
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_published(
        &self,
        id: &str,
        external_ref: &str,
        published_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_publishing(id, |item| {
            item.status = ItemStatus::Published;
            item.external_ref = Some(external_ref.to_string());
            item.published_at = Some(published_at);
            item.error_message = None;
            item.updated_at = published_at;
        })
    }

    async fn mark_retrying(
        &self,
        id: &str,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_publishing(id, |item| {
            item.status = ItemStatus::Retrying;
            item.retry_count = retry_count;
            item.scheduled_at = next_attempt_at;
            item.error_message = Some(error.to_string());
            item.updated_at = now;
        })
    }

    async fn mark_failed(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<bool> {
        self.update_publishing(id, |item| {
            item.status = ItemStatus::Failed;
            item.error_message = Some(error.to_string());
            item.updated_at = now;
        })
    }

    async fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut tables = self.tables()?;
        let mut reclaimed = Vec::new();

        for item in tables.items.values_mut() {
            let stale = item.claimed_at.map_or(true, |at| at <= stale_before);
            if item.status == ItemStatus::Publishing && stale {
                item.status = ItemStatus::Retrying;
                item.scheduled_at = now;
                item.claimed_at = None;
                item.updated_at = now;
                item.error_message = Some("reclaimed after stale publishing claim".to_string());
                reclaimed.push(item.id.clone());
            }
        }

        reclaimed.sort();
        Ok(reclaimed)
    }

    async fn reschedule(&self, id: &str, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables()?;
        match tables.items.get_mut(id) {
            Some(item)
                if !matches!(item.status, ItemStatus::Publishing | ItemStatus::Published) =>
            {
                item.status = ItemStatus::Scheduled;
                item.scheduled_at = at;
                item.retry_count = 0;
                item.error_message = None;
                item.claimed_at = None;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_item(&self, id: &str) -> Result<bool> {
        let mut tables = self.tables()?;
        match tables.items.get(id) {
            Some(item) if item.status != ItemStatus::Publishing => {
                tables.items.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CronRunRepository for InMemoryStore {
    async fn start_run(&self, run: &CronRun) -> Result<()> {
        let mut tables = self.tables()?;
        if tables.runs.iter().any(|r| r.id == run.id) {
            anyhow::bail!("Cron run {} already exists", run.id);
        }
        tables.runs.push(run.clone());
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
        let mut tables = self.tables()?;
        match tables.runs.iter_mut().find(|r| r.id == id) {
            Some(run) if run.is_open() => {
                run.finished_at = Some(finished_at);
                run.success = success;
                run.counts = *counts;
                run.error_message = error.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_run(&self, id: &str) -> Result<Option<CronRun>> {
        Ok(self.tables()?.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn open_runs(&self, job_name: &str) -> Result<Vec<CronRun>> {
        let tables = self.tables()?;
        let mut open: Vec<_> = tables
            .runs
            .iter()
            .filter(|r| r.job_name == job_name && r.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|r| r.started_at);
        Ok(open)
    }

    async fn recent_runs(&self, job_name: &str, limit: usize) -> Result<Vec<CronRun>> {
        let tables = self.tables()?;
        let mut runs: Vec<(usize, &CronRun)> = tables
            .runs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.job_name == job_name)
            .collect();
        runs.sort_by(|(ia, a), (ib, b)| b.started_at.cmp(&a.started_at).then(ib.cmp(ia)));
        Ok(runs.into_iter().take(limit).map(|(_, r)| r.clone()).collect())
    }
}

#[async_trait]
impl MediaRepository for InMemoryStore {
    async fn insert_media(&self, media: &MediaRecord) -> Result<()> {
        let mut tables = self.tables()?;
        if tables
            .media
            .values()
            .any(|m| m.id == media.id || m.provider_ref == media.provider_ref)
        {
            anyhow::bail!("Media {} already registered", media.provider_ref);
        }
        tables.media.insert(media.id.clone(), media.clone());
        Ok(())
    }

    async fn get_media(&self, id: &str) -> Result<Option<MediaRecord>> {
        Ok(self.tables()?.media.get(id).cloned())
    }

    async fn find_media_by_provider_ref(&self, provider_ref: &str) -> Result<Option<MediaRecord>> {
        Ok(self
            .tables()?
            .media
            .values()
            .find(|m| m.provider_ref == provider_ref)
            .cloned())
    }

    async fn advance_video_status(
        &self,
        id: &str,
        expected: Option<VideoStatus>,
        next: VideoStatus,
        playable_url: Option<&str>,
        thumbnail_url: Option<&str>,
    ) -> Result<bool> {
        let mut tables = self.tables()?;
        match tables.media.get_mut(id) {
            Some(media) if media.video_status == expected => {
                media.video_status = Some(next);
                if let Some(url) = playable_url {
                    media.playable_url = Some(url.to_string());
                }
                if let Some(url) = thumbnail_url {
                    media.thumbnail_url = Some(url.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PostPayload;

    #[tokio::test]
    async fn test_duplicate_item_rejected() {
        let store = InMemoryStore::new();
        let item = ScheduledItem::scheduled("acct", PostPayload::default(), Utc::now()).with_id("a");

        store.create_item(&item).await.unwrap();
        assert!(store.create_item(&item).await.is_err());
        assert_eq!(store.item_count(), 1);
    }

    #[tokio::test]
    async fn test_draft_is_claimable_but_not_due() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut item = ScheduledItem::scheduled("acct", PostPayload::default(), now).with_id("d");
        item.status = ItemStatus::Draft;
        store.create_item(&item).await.unwrap();

        assert!(store.select_due(now, 10).await.unwrap().is_empty());
        assert!(store.claim("d", now).await.unwrap());
    }
}
