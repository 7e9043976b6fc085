//! Circuit breaker keyed by upstream endpoint
//!
//! The state machine lives on [`CircuitBreakerState`] as pure transitions over
//! an injected `now`; [`CircuitBreakerRegistry`] loads and stores that state
//! through a [`BreakerStore`] so it can live in process memory or in a shared
//! store visible to other processes.
//!
//! Transitions:
//! - `closed -> open` when consecutive transient failures reach the threshold
//! - `open -> half_open` on the first call after the cooldown (that call is the probe)
//! - `half_open -> closed` when the probe succeeds
//! - `half_open -> open` when the probe fails
//!
//! Permanent failures never change the state. A probe refused with one frees
//! the probe slot without closing the circuit.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::{to_chrono, SharedClock};
use crate::config::ResilienceConfig;
use crate::metrics;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Calls are rejected without reaching the endpoint
    Open,
    /// One probe call is testing whether the endpoint recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive transient failures that open the circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a probe
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&ResilienceConfig> for BreakerSettings {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_secs(config.cooldown_secs),
        }
    }
}

/// Decision taken before a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; call normally
    Allowed,
    /// Circuit half-open; this call is the single probe
    Probe,
    /// Circuit open; fail fast
    Rejected { retry_after: Duration },
}

/// How a call ended, as far as the breaker is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// Timeout, 5xx, rate limit, connection failure
    TransientFailure,
    /// The endpoint answered but refused the request (validation, auth)
    PermanentFailure,
}

/// Per-endpoint breaker record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    /// When the current half-open probe was admitted
    pub probe_started_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    pub fn closed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            probe_started_at: None,
        }
    }

    /// Decide whether a call may proceed at `now`; may move `open -> half_open`
    pub fn admit(&mut self, now: DateTime<Utc>, settings: &BreakerSettings) -> Admission {
        let cooldown = to_chrono(settings.cooldown);
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let reopen_at = self.opened_at.unwrap_or(now) + cooldown;
                if now >= reopen_at {
                    self.state = CircuitState::HalfOpen;
                    self.probe_started_at = Some(now);
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_after: (reopen_at - now).to_std().unwrap_or_default(),
                    }
                }
            }
            CircuitState::HalfOpen => {
                // A probe that never reported back is replaced after a full cooldown
                let probe_deadline = self.probe_started_at.unwrap_or(now) + cooldown;
                if self.probe_started_at.is_none() || now >= probe_deadline {
                    self.probe_started_at = Some(now);
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_after: (probe_deadline - now).to_std().unwrap_or_default(),
                    }
                }
            }
        }
    }

    /// Apply a call outcome; returns the new state when it changed
    pub fn on_outcome(
        &mut self,
        outcome: CallOutcome,
        now: DateTime<Utc>,
        settings: &BreakerSettings,
    ) -> Option<CircuitState> {
        let before = self.state;

        match outcome {
            CallOutcome::Success => self.reset(),
            CallOutcome::PermanentFailure => {
                // Not a success: stay half-open and let the next call probe
                if self.state == CircuitState::HalfOpen {
                    self.probe_started_at = None;
                }
            }
            CallOutcome::TransientFailure => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_failure_at = Some(now);

                let trip = match self.state {
                    CircuitState::HalfOpen => true,
                    CircuitState::Closed => self.consecutive_failures >= settings.failure_threshold,
                    CircuitState::Open => false,
                };
                if trip {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                    self.probe_started_at = None;
                }
            }
        }

        (self.state != before).then_some(self.state)
    }

    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_started_at = None;
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Keyed table of breaker records
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<CircuitBreakerState>>;

    async fn save(&self, state: &CircuitBreakerState) -> Result<()>;

    /// All known records, for observability
    async fn list(&self) -> Result<Vec<CircuitBreakerState>>;
}

/// Process-local breaker table
#[derive(Default)]
pub struct InMemoryBreakerStore {
    states: Mutex<HashMap<String, CircuitBreakerState>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for InMemoryBreakerStore {
    async fn load(&self, key: &str) -> Result<Option<CircuitBreakerState>> {
        let states = self
            .states
            .lock()
            .map_err(|e| anyhow::anyhow!("breaker table poisoned: {e}"))?;
        Ok(states.get(key).cloned())
    }

    async fn save(&self, state: &CircuitBreakerState) -> Result<()> {
        let mut states = self
            .states
            .lock()
            .map_err(|e| anyhow::anyhow!("breaker table poisoned: {e}"))?;
        states.insert(state.key.clone(), state.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CircuitBreakerState>> {
        let states = self
            .states
            .lock()
            .map_err(|e| anyhow::anyhow!("breaker table poisoned: {e}"))?;
        let mut all: Vec<_> = states.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Applies breaker transitions for many endpoint keys
///
/// Updates for one key are serialized through a per-key async mutex. A failing
/// [`BreakerStore`] never blocks calls: the breaker is treated as closed and the
/// error is logged, since breaker state only protects the upstream.
pub struct CircuitBreakerRegistry {
    store: Arc<dyn BreakerStore>,
    settings: BreakerSettings,
    clock: SharedClock,
    guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(store: Arc<dyn BreakerStore>, settings: BreakerSettings, clock: SharedClock) -> Self {
        Self {
            store,
            settings,
            clock,
            guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    fn guard_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.guards.lock() {
            Ok(mut guards) => guards.entry(key.to_string()).or_default().clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    async fn load_or_closed(&self, key: &str) -> Option<CircuitBreakerState> {
        match self.store.load(key).await {
            Ok(state) => Some(state.unwrap_or_else(|| CircuitBreakerState::closed(key))),
            Err(e) => {
                warn!(endpoint = %key, error = %e, "Breaker store unavailable, treating circuit as closed");
                None
            }
        }
    }

    async fn persist(&self, state: &CircuitBreakerState) {
        if let Err(e) = self.store.save(state).await {
            warn!(endpoint = %state.key, error = %e, "Failed to persist breaker state");
        }
    }

    /// Consult the breaker before a call
    pub async fn admit(&self, key: &str) -> Admission {
        let guard = self.guard_for(key);
        let _held = guard.lock().await;

        let Some(mut state) = self.load_or_closed(key).await else {
            return Admission::Allowed;
        };

        let before = state.state;
        let admission = state.admit(self.clock.now(), &self.settings);
        if admission == Admission::Probe {
            if before != state.state {
                info!(endpoint = %key, "Circuit half-open, admitting probe");
                metrics::record_circuit_transition(key, state.state);
            }
            self.persist(&state).await;
        }

        admission
    }

    /// Report how a call ended
    pub async fn record(&self, key: &str, outcome: CallOutcome) {
        let guard = self.guard_for(key);
        let _held = guard.lock().await;

        let Some(mut state) = self.load_or_closed(key).await else {
            return;
        };

        let before = state.clone();
        if let Some(target) = state.on_outcome(outcome, self.clock.now(), &self.settings) {
            match target {
                CircuitState::Open => warn!(
                    endpoint = %key,
                    consecutive_failures = state.consecutive_failures,
                    "Circuit opened"
                ),
                CircuitState::Closed => info!(endpoint = %key, "Circuit closed"),
                CircuitState::HalfOpen => {}
            }
            metrics::record_circuit_transition(key, target);
        }

        if state != before {
            self.persist(&state).await;
        }
    }

    /// Current record for `key` (closed when unknown)
    pub async fn snapshot(&self, key: &str) -> Result<CircuitBreakerState> {
        Ok(self
            .store
            .load(key)
            .await?
            .unwrap_or_else(|| CircuitBreakerState::closed(key)))
    }

    /// All known records
    pub async fn states(&self) -> Result<Vec<CircuitBreakerState>> {
        self.store.list().await
    }
}
