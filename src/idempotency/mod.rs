//! Idempotency store
//!
//! Maps a caller-supplied key to the first recorded outcome of a
//! side-effecting call. Before doing the work, a caller runs
//! [`IdempotencyStore::get_or_reserve`]:
//!
//! - `Found`: replay the stored status and body verbatim
//! - `InProgress`: another caller holds a live reservation for the key
//! - `Reserved`: this caller owns the key until it records or releases it
//!
//! Recording is first-write-wins: it only replaces a pending reservation or an
//! absent key. Completed records expire after their TTL; reservations expire
//! after the (shorter) reservation TTL so a crashed caller does not wedge a key.
//! Expired entries are purged on every reservation.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::{to_chrono, SharedClock};
use crate::models::IdempotencyRecord;

/// Namespace of keys supplied by API clients
///
/// Internal publish keys (`cast:<id>`) live outside it, so a client key can
/// never shadow or collide with the scheduler's own records.
pub const CLIENT_KEY_PREFIX: &str = "client:";

/// Store key for a client-supplied idempotency key
pub fn client_key(key: &str) -> String {
    format!("{CLIENT_KEY_PREFIX}{key}")
}

/// Result of [`IdempotencyStore::get_or_reserve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(IdempotencyRecord),
    InProgress,
    Reserved,
}

/// Result of [`IdempotencyStore::record`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Stored,
    /// A completed record already existed; it was left untouched
    AlreadyRecorded(IdempotencyRecord),
}

/// Keyed store of recorded outcomes with atomic reservation
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Return the recorded outcome for `key`, or reserve the key
    async fn get_or_reserve(&self, key: &str, reservation_ttl: Duration) -> Result<Lookup>;

    /// Record the outcome for `key` unless one is already recorded
    async fn record(&self, key: &str, status: u16, data: &str, ttl: Duration)
        -> Result<RecordOutcome>;

    /// Drop a pending reservation; completed records are kept
    async fn release(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Entry {
    Pending { expires_at: chrono::DateTime<chrono::Utc> },
    Done(IdempotencyRecord),
}

impl Entry {
    fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self {
            Self::Pending { expires_at } => *expires_at <= now,
            Self::Done(record) => record.is_expired(now),
        }
    }
}

/// Process-local idempotency store
pub struct InMemoryIdempotencyStore {
    clock: SharedClock,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryIdempotencyStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|e| anyhow::anyhow!("idempotency table poisoned: {e}"))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get_or_reserve(&self, key: &str, reservation_ttl: Duration) -> Result<Lookup> {
        let now = self.clock.now();
        let mut entries = self.entries()?;
        entries.retain(|_, entry| !entry.is_expired(now));

        match entries.get(key) {
            Some(Entry::Done(record)) if !record.is_expired(now) => {
                return Ok(Lookup::Found(record.clone()));
            }
            Some(Entry::Pending { expires_at }) if *expires_at > now => {
                return Ok(Lookup::InProgress);
            }
            _ => {}
        }

        entries.insert(
            key.to_string(),
            Entry::Pending {
                expires_at: now + to_chrono(reservation_ttl),
            },
        );
        Ok(Lookup::Reserved)
    }

    async fn record(
        &self,
        key: &str,
        status: u16,
        data: &str,
        ttl: Duration,
    ) -> Result<RecordOutcome> {
        let now = self.clock.now();
        let mut entries = self.entries()?;

        if let Some(Entry::Done(existing)) = entries.get(key) {
            if !existing.is_expired(now) {
                return Ok(RecordOutcome::AlreadyRecorded(existing.clone()));
            }
        }

        entries.insert(
            key.to_string(),
            Entry::Done(IdempotencyRecord {
                key: key.to_string(),
                status,
                data: data.to_string(),
                expires_at: now + to_chrono(ttl),
            }),
        );
        Ok(RecordOutcome::Stored)
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut entries = self.entries()?;
        if matches!(entries.get(key), Some(Entry::Pending { .. })) {
            entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    const DAY: Duration = Duration::from_secs(86_400);
    const RESERVE: Duration = Duration::from_secs(60);

    fn store() -> (InMemoryIdempotencyStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        (InMemoryIdempotencyStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_reserve_then_record_then_replay() {
        let (store, _clock) = store();

        assert_eq!(store.get_or_reserve("k", RESERVE).await.unwrap(), Lookup::Reserved);
        assert_eq!(store.get_or_reserve("k", RESERVE).await.unwrap(), Lookup::InProgress);

        let outcome = store.record("k", 200, r#"{"ok":true}"#, DAY).await.unwrap();
        assert_eq!(outcome, RecordOutcome::Stored);

        let Lookup::Found(first) = store.get_or_reserve("k", RESERVE).await.unwrap() else {
            panic!("expected recorded outcome");
        };
        let Lookup::Found(second) = store.get_or_reserve("k", RESERVE).await.unwrap() else {
            panic!("expected recorded outcome");
        };
        assert_eq!(first, second);
        assert_eq!(first.data, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_first_write_wins() {
        let (store, _clock) = store();
        store.record("k", 201, "first", DAY).await.unwrap();

        let outcome = store.record("k", 500, "second", DAY).await.unwrap();
        let RecordOutcome::AlreadyRecorded(existing) = outcome else {
            panic!("second write must be rejected");
        };
        assert_eq!(existing.status, 201);
        assert_eq!(existing.data, "first");
    }

    #[tokio::test]
    async fn test_reservation_expires() {
        let (store, clock) = store();
        store.get_or_reserve("k", RESERVE).await.unwrap();

        clock.advance(RESERVE);
        assert_eq!(store.get_or_reserve("k", RESERVE).await.unwrap(), Lookup::Reserved);
    }

    #[tokio::test]
    async fn test_record_expires() {
        let (store, clock) = store();
        store.record("k", 200, "done", Duration::from_secs(10)).await.unwrap();

        clock.advance(Duration::from_secs(11));
        assert_eq!(store.get_or_reserve("k", RESERVE).await.unwrap(), Lookup::Reserved);
    }

    #[tokio::test]
    async fn test_expired_entries_are_purged() {
        let (store, clock) = store();
        store.record("old", 200, "done", Duration::from_secs(10)).await.unwrap();
        store.get_or_reserve("abandoned", Duration::from_secs(10)).await.unwrap();
        store.record("fresh", 200, "done", DAY).await.unwrap();

        clock.advance(Duration::from_secs(11));
        store.get_or_reserve("next", RESERVE).await.unwrap();

        let entries = store.entries().unwrap();
        assert!(!entries.contains_key("old"));
        assert!(!entries.contains_key("abandoned"));
        assert!(entries.contains_key("fresh"));
        assert!(entries.contains_key("next"));
    }

    #[tokio::test]
    async fn test_release_only_drops_pending() {
        let (store, _clock) = store();

        store.get_or_reserve("pending", RESERVE).await.unwrap();
        store.release("pending").await.unwrap();
        assert_eq!(
            store.get_or_reserve("pending", RESERVE).await.unwrap(),
            Lookup::Reserved
        );

        store.record("done", 200, "body", DAY).await.unwrap();
        store.release("done").await.unwrap();
        assert!(matches!(
            store.get_or_reserve("done", RESERVE).await.unwrap(),
            Lookup::Found(_)
        ));
    }
}
