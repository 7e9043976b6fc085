//! Redis-backed shared state
//!
//! Holds the state that must be visible to every process running the
//! pipeline:
//! - Lock leases: `SET NX PX`, released with a compare-and-delete script
//! - Idempotency records: a pending marker reserved atomically, replaced by
//!   the first completed outcome
//! - Circuit breaker records: JSON per endpoint key
//!
//! Key expiry uses the Redis server clock; the injected clock only stamps
//! `expires_at` on records returned to callers.
//!
//! # Example
//!
//! ```rust,ignore
//! use castline::shared::RedisStore;
//!
//! let store = RedisStore::new(&config.shared_state, clock).await?;
//! let outcome = store.acquire("lock:publish-due-casts", ttl).await?;
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::{to_chrono, SharedClock};
use crate::config::SharedStateConfig;
use crate::idempotency::{IdempotencyStore, Lookup, RecordOutcome};
use crate::lock::{new_owner_token, AcquireOutcome, DistributedLock, LockGrant};
use crate::models::IdempotencyRecord;
use crate::resilience::{BreakerStore, CircuitBreakerState};

/// Value stored for a reserved but unfinished idempotency key
const PENDING_MARKER: &str = "__castline_pending__";

/// Delete the key only while it still holds the caller's token
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Return the existing value, or store the pending marker and return nil
const RESERVE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    return current
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return false
"#;

/// Store the outcome unless a completed outcome already exists
const RECORD_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and current ~= ARGV[1] then
    return current
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return false
"#;

/// Delete the key only while it still holds the pending marker
const RELEASE_RESERVATION_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    status: u16,
    data: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

impl StoredRecord {
    fn into_record(self, key: &str) -> IdempotencyRecord {
        IdempotencyRecord {
            key: key.to_string(),
            status: self.status,
            data: self.data,
            expires_at: self.expires_at,
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis client for shared pipeline state
pub struct RedisStore {
    /// Connection pool
    pool: Pool,
    /// Key prefix for namespacing
    key_prefix: String,
    clock: SharedClock,
}

impl RedisStore {
    /// Connect and verify the server answers
    pub async fn new(config: &SharedStateConfig, clock: SharedClock) -> Result<Self> {
        let pool_config = PoolConfig::from_url(&config.redis_url);
        let pool = pool_config
            .builder()
            .map_err(|e| anyhow::anyhow!("Failed to create pool builder: {e}"))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .context("Failed to create Redis connection pool")?;

        // Test connection
        let mut conn = pool.get().await.context("Failed to get Redis connection")?;

        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .context("Failed to ping Redis")?;

        tracing::info!(url = %config.redis_url, "Connected to Redis");

        Ok(Self {
            pool,
            key_prefix: config.key_prefix.clone(),
            clock,
        })
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.key_prefix, key)
    }

    fn idempotency_key(&self, key: &str) -> String {
        format!("{}:idem:{}", self.key_prefix, key)
    }

    fn breaker_key(&self, key: &str) -> String {
        format!("{}:breaker:{}", self.key_prefix, key)
    }

    fn breaker_index_key(&self) -> String {
        format!("{}:breakers", self.key_prefix)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.context("Failed to get Redis connection")
    }

    /// Check if Redis is healthy
    pub async fn health_check(&self) -> Result<bool> {
        let mut conn = self.connection().await?;
        let result: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(result == "PONG")
    }
}

#[async_trait]
impl DistributedLock for RedisStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<AcquireOutcome> {
        let mut conn = self.connection().await?;
        let token = new_owner_token();

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await
            .context("Failed to acquire Redis lock")?;

        Ok(match reply {
            Some(_) => AcquireOutcome::Granted(LockGrant {
                key: key.to_string(),
                owner_token: token,
                expires_at: self.clock.now() + to_chrono(ttl),
            }),
            None => AcquireOutcome::Denied,
        })
    }

    async fn release(&self, key: &str, owner_token: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(self.lock_key(key))
            .arg(owner_token)
            .invoke_async(&mut *conn)
            .await
            .context("Failed to release Redis lock")?;
        Ok(deleted == 1)
    }
}

#[async_trait]
impl IdempotencyStore for RedisStore {
    async fn get_or_reserve(&self, key: &str, reservation_ttl: Duration) -> Result<Lookup> {
        let mut conn = self.connection().await?;
        let existing: Option<String> = redis::Script::new(RESERVE_SCRIPT)
            .key(self.idempotency_key(key))
            .arg(PENDING_MARKER)
            .arg(ttl_millis(reservation_ttl))
            .invoke_async(&mut *conn)
            .await
            .context("Failed to reserve idempotency key")?;

        match existing {
            None => Ok(Lookup::Reserved),
            Some(value) if value == PENDING_MARKER => Ok(Lookup::InProgress),
            Some(value) => {
                let stored: StoredRecord =
                    serde_json::from_str(&value).context("Corrupt idempotency record")?;
                Ok(Lookup::Found(stored.into_record(key)))
            }
        }
    }

    async fn record(
        &self,
        key: &str,
        status: u16,
        data: &str,
        ttl: Duration,
    ) -> Result<RecordOutcome> {
        let value = serde_json::to_string(&StoredRecord {
            status,
            data: data.to_string(),
            expires_at: self.clock.now() + to_chrono(ttl),
        })?;

        let mut conn = self.connection().await?;
        let existing: Option<String> = redis::Script::new(RECORD_SCRIPT)
            .key(self.idempotency_key(key))
            .arg(PENDING_MARKER)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut *conn)
            .await
            .context("Failed to record idempotency outcome")?;

        match existing {
            None => Ok(RecordOutcome::Stored),
            Some(value) => {
                let stored: StoredRecord =
                    serde_json::from_str(&value).context("Corrupt idempotency record")?;
                Ok(RecordOutcome::AlreadyRecorded(stored.into_record(key)))
            }
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::Script::new(RELEASE_RESERVATION_SCRIPT)
            .key(self.idempotency_key(key))
            .arg(PENDING_MARKER)
            .invoke_async(&mut *conn)
            .await
            .context("Failed to release idempotency reservation")?;
        Ok(())
    }
}

#[async_trait]
impl BreakerStore for RedisStore {
    async fn load(&self, key: &str) -> Result<Option<CircuitBreakerState>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn
            .get(self.breaker_key(key))
            .await
            .context("Failed to load breaker state")?;
        value
            .map(|v| serde_json::from_str(&v).context("Corrupt breaker state"))
            .transpose()
    }

    async fn save(&self, state: &CircuitBreakerState) -> Result<()> {
        let value = serde_json::to_string(state)?;
        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .set(self.breaker_key(&state.key), value)
            .ignore()
            .sadd(self.breaker_index_key(), &state.key)
            .ignore()
            .query_async(&mut *conn)
            .await
            .context("Failed to save breaker state")?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CircuitBreakerState>> {
        let mut conn = self.connection().await?;
        let mut keys: Vec<String> = conn
            .smembers(self.breaker_index_key())
            .await
            .context("Failed to list breaker keys")?;
        keys.sort();

        let mut states = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<String> = conn.get(self.breaker_key(&key)).await?;
            if let Some(v) = value {
                states.push(serde_json::from_str(&v).context("Corrupt breaker state")?);
            }
        }
        Ok(states)
    }
}
