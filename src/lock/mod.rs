//! Distributed lock (lease with owner token and TTL)
//!
//! A lock is held iff a record for its key exists and has not expired.
//! Acquisition is a single atomic insert-if-absent and never waits: a denial
//! means another run is active. Release only removes the record when the
//! caller's token still owns it, so a slow holder cannot free a lease that
//! already rolled over to someone else.
//!
//! Backends: [`InMemoryLock`] here, `SqliteStore` in [`crate::storage`] and
//! `RedisStore` in [`crate::shared`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::{to_chrono, SharedClock};

/// A granted lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub key: String,
    pub owner_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of an acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted(LockGrant),
    /// A live lease exists for the key
    Denied,
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Lease-based mutual exclusion across processes
///
/// Implementations must perform acquisition as one atomic check-and-set.
/// Store failures are returned as errors; callers treat them as denial.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lease for `key`
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<AcquireOutcome>;

    /// Release the lease; returns `false` (no-op) when the record is gone or
    /// owned by a different token
    async fn release(&self, key: &str, owner_token: &str) -> Result<bool>;
}

/// Random owner token, unique per acquisition attempt
pub fn new_owner_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone)]
struct LeaseRecord {
    owner_token: String,
    expires_at: DateTime<Utc>,
}

/// Process-local lock for single-instance deployments and tests
pub struct InMemoryLock {
    clock: SharedClock,
    leases: Mutex<HashMap<String, LeaseRecord>>,
}

impl InMemoryLock {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            leases: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<AcquireOutcome> {
        let now = self.clock.now();
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| anyhow::anyhow!("lock table poisoned: {e}"))?;

        if let Some(existing) = leases.get(key) {
            if existing.expires_at > now {
                return Ok(AcquireOutcome::Denied);
            }
        }

        let grant = LockGrant {
            key: key.to_string(),
            owner_token: new_owner_token(),
            expires_at: now + to_chrono(ttl),
        };
        leases.insert(
            key.to_string(),
            LeaseRecord {
                owner_token: grant.owner_token.clone(),
                expires_at: grant.expires_at,
            },
        );

        Ok(AcquireOutcome::Granted(grant))
    }

    async fn release(&self, key: &str, owner_token: &str) -> Result<bool> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| anyhow::anyhow!("lock table poisoned: {e}"))?;

        match leases.get(key) {
            Some(record) if record.owner_token == owner_token => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn lock_with_clock() -> (InMemoryLock, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        (InMemoryLock::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_second_acquire_is_denied() {
        let (lock, _clock) = lock_with_clock();

        let first = lock.acquire("job", Duration::from_secs(60)).await.unwrap();
        assert!(first.is_granted());

        let second = lock.acquire("job", Duration::from_secs(60)).await.unwrap();
        assert_eq!(second, AcquireOutcome::Denied);
    }

    #[tokio::test]
    async fn test_expired_lease_is_superseded() {
        let (lock, clock) = lock_with_clock();

        let AcquireOutcome::Granted(first) =
            lock.acquire("job", Duration::from_secs(60)).await.unwrap()
        else {
            panic!("expected grant");
        };

        clock.advance(Duration::from_secs(60));
        let AcquireOutcome::Granted(second) =
            lock.acquire("job", Duration::from_secs(60)).await.unwrap()
        else {
            panic!("expected grant after expiry");
        };
        assert_ne!(first.owner_token, second.owner_token);

        // The old holder cannot release the new lease
        assert!(!lock.release("job", &first.owner_token).await.unwrap());
        assert!(!lock.acquire("job", Duration::from_secs(60)).await.unwrap().is_granted());

        assert!(lock.release("job", &second.owner_token).await.unwrap());
        assert!(lock.acquire("job", Duration::from_secs(60)).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_release_missing_is_noop() {
        let (lock, _clock) = lock_with_clock();
        assert!(!lock.release("nothing", "token").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (lock, _clock) = lock_with_clock();
        assert!(lock.acquire("a", Duration::from_secs(5)).await.unwrap().is_granted());
        assert!(lock.acquire("b", Duration::from_secs(5)).await.unwrap().is_granted());
    }
}
