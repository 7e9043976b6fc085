//! Crash recovery
//!
//! An item is marked `publishing` before its outbound call. A process that dies
//! mid-call leaves the item there; once its claim is older than the staleness
//! threshold it is re-classified to `retrying`, due immediately, with its
//! retry count untouched. The upstream idempotency key makes the re-attempt
//! safe when the lost call actually succeeded.
//!
//! Runs left open by a dead process are closed as failed. This is only sound
//! while holding the scheduler lock.

use std::time::Duration;
use tracing::{info, warn};

use super::error::{SchedulerError, SchedulerResult};
use crate::clock::{to_chrono, Clock};
use crate::storage::{CronRunRepository, ItemRepository};

/// Error message stored on runs closed by recovery
pub const ABANDONED_RUN_MESSAGE: &str = "abandoned: run never finalized";

/// Re-classify items stuck in `publishing` for longer than `stale_after`
pub async fn reclaim_stale_items(
    items: &dyn ItemRepository,
    clock: &dyn Clock,
    stale_after: Duration,
) -> SchedulerResult<Vec<String>> {
    let now = clock.now();
    let reclaimed = items
        .reclaim_stale(now - to_chrono(stale_after), now)
        .await
        .map_err(|e| SchedulerError::storage("reclaim stale items", e))?;

    for id in &reclaimed {
        warn!(item_id = %id, "Reclaimed item stuck in publishing");
    }
    if !reclaimed.is_empty() {
        info!(count = reclaimed.len(), "Stale publishing items re-classified to retrying");
    }

    Ok(reclaimed)
}

/// Close every open run of `job_name` except `current_run_id`
pub async fn close_abandoned_runs(
    runs: &dyn CronRunRepository,
    clock: &dyn Clock,
    job_name: &str,
    current_run_id: &str,
) -> SchedulerResult<usize> {
    let open = runs
        .open_runs(job_name)
        .await
        .map_err(|e| SchedulerError::storage("list open runs", e))?;

    let mut closed = 0;
    for run in open.iter().filter(|r| r.id != current_run_id) {
        let finished = runs
            .finish_run(
                &run.id,
                clock.now(),
                false,
                &run.counts,
                Some(ABANDONED_RUN_MESSAGE),
            )
            .await
            .map_err(|e| SchedulerError::storage("close abandoned run", e))?;
        if finished {
            warn!(run_id = %run.id, started_at = %run.started_at, "Closed abandoned run");
            closed += 1;
        }
    }

    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{CronRun, ItemStatus, PostPayload, RunCounts, ScheduledItem};
    use crate::storage::InMemoryStore;
    use chrono::{TimeZone, Utc};

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_reclaims_only_stale_claims() {
        let clock = clock();
        let store = InMemoryStore::new();
        let start = clock.now();

        for id in ["old", "fresh"] {
            let item = ScheduledItem::scheduled("acct", PostPayload::default(), start).with_id(id);
            store.create_item(&item).await.unwrap();
        }
        store.claim("old", start).await.unwrap();
        clock.advance(Duration::from_secs(600));
        store.claim("fresh", clock.now()).await.unwrap();
        clock.advance(Duration::from_secs(400));

        let reclaimed = reclaim_stale_items(&store, &clock, Duration::from_secs(900))
            .await
            .unwrap();
        assert_eq!(reclaimed, vec!["old".to_string()]);

        let old = store.get_item("old").await.unwrap().unwrap();
        assert_eq!(old.status, ItemStatus::Retrying);
        assert_eq!(old.retry_count, 0);
        assert!(old.is_due(clock.now()));

        let fresh = store.get_item("fresh").await.unwrap().unwrap();
        assert_eq!(fresh.status, ItemStatus::Publishing);
    }

    #[tokio::test]
    async fn test_closes_other_open_runs() {
        let clock = clock();
        let store = InMemoryStore::new();

        for id in ["dead", "current"] {
            store
                .start_run(&CronRun {
                    id: id.to_string(),
                    job_name: "job".to_string(),
                    source: "test".to_string(),
                    started_at: clock.now(),
                    finished_at: None,
                    success: false,
                    counts: RunCounts::default(),
                    error_message: None,
                })
                .await
                .unwrap();
        }

        let closed = close_abandoned_runs(&store, &clock, "job", "current")
            .await
            .unwrap();
        assert_eq!(closed, 1);

        let dead = store.get_run("dead").await.unwrap().unwrap();
        assert!(!dead.success);
        assert_eq!(dead.error_message.as_deref(), Some(ABANDONED_RUN_MESSAGE));
        assert!(store.get_run("current").await.unwrap().unwrap().is_open());
    }
}
