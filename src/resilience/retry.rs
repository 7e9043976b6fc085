//! Retry policy for outbound calls
//!
//! [`RetryPolicy::execute`] runs an operation with bounded attempts, a
//! per-attempt timeout and exponential backoff between attempts. The circuit
//! breaker for the endpoint is consulted before every attempt and told about
//! every outcome. Waiting goes through the injected [`Sleeper`](crate::clock::Sleeper).

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::backoff::BackoffPolicy;
use super::breaker::{Admission, CallOutcome, CircuitBreakerRegistry};
use crate::clock::SharedSleeper;
use crate::config::ResilienceConfig;

/// Whether a failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout, 5xx, rate limit, connection error
    Transient,
    /// Validation, authorization and other 4xx-class refusals
    Permanent,
}

/// Errors that know their own retry classification
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

/// Why a single attempt failed
#[derive(Debug)]
pub enum AttemptFailure<E> {
    /// The attempt did not finish within the per-call timeout
    TimedOut(Duration),
    /// The operation returned an error
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut(after) => write!(f, "timed out after {}ms", after.as_millis()),
            Self::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Failure of a resilient call
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError<E: fmt::Display + fmt::Debug> {
    /// The breaker rejected the call without invoking the operation
    #[error("circuit open for '{endpoint}' (retry after {}s)", .retry_after.as_secs())]
    CircuitOpen {
        endpoint: String,
        retry_after: Duration,
        /// Attempts made before the breaker stopped the call
        attempts: u32,
    },

    /// Every attempt failed transiently
    #[error("retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        last: AttemptFailure<E>,
    },

    /// The operation failed in a way that must not be retried
    #[error("{0}")]
    Permanent(E),
}

impl<E: fmt::Display + fmt::Debug> ResilienceError<E> {
    /// Transient from the caller's point of view (circuit open counts as transient)
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Bounded retries with backoff behind a circuit breaker
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: BackoffPolicy,
    breaker: Arc<CircuitBreakerRegistry>,
    sleeper: SharedSleeper,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff: BackoffPolicy,
        breaker: Arc<CircuitBreakerRegistry>,
        sleeper: SharedSleeper,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            breaker,
            sleeper,
        }
    }

    /// Build from the resilience configuration section
    pub fn from_config(
        config: &ResilienceConfig,
        breaker: Arc<CircuitBreakerRegistry>,
        sleeper: SharedSleeper,
    ) -> Self {
        Self::new(
            config.max_attempts,
            BackoffPolicy::for_calls(config),
            breaker,
            sleeper,
        )
    }

    pub fn breaker(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breaker
    }

    /// Execute `operation` against `endpoint`
    ///
    /// The operation receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(
        &self,
        endpoint: &str,
        call_timeout: Duration,
        mut operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display + fmt::Debug,
    {
        let mut last_failure = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.backoff.jittered(attempt - 1, &mut rand::thread_rng());
                debug!(
                    endpoint = %endpoint,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying call after delay"
                );
                self.sleeper.sleep(delay).await;
            }

            if let Admission::Rejected { retry_after } = self.breaker.admit(endpoint).await {
                debug!(endpoint = %endpoint, attempt = attempt, "Circuit open, failing fast");
                return Err(ResilienceError::CircuitOpen {
                    endpoint: endpoint.to_string(),
                    retry_after,
                    attempts: attempt - 1,
                });
            }

            let failure = match tokio::time::timeout(call_timeout, operation(attempt)).await {
                Ok(Ok(value)) => {
                    self.breaker.record(endpoint, CallOutcome::Success).await;
                    if attempt > 1 {
                        debug!(endpoint = %endpoint, attempt = attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) if e.failure_kind() == FailureKind::Permanent => {
                    self.breaker.record(endpoint, CallOutcome::PermanentFailure).await;
                    warn!(endpoint = %endpoint, attempt = attempt, error = %e, "Call failed permanently");
                    return Err(ResilienceError::Permanent(e));
                }
                Ok(Err(e)) => AttemptFailure::Failed(e),
                Err(_) => AttemptFailure::TimedOut(call_timeout),
            };

            self.breaker.record(endpoint, CallOutcome::TransientFailure).await;
            warn!(
                endpoint = %endpoint,
                attempt = attempt,
                max_attempts = self.max_attempts,
                error = %failure,
                "Call failed transiently"
            );
            last_failure = Some(failure);
        }

        match last_failure {
            Some(last) => Err(ResilienceError::ExhaustedRetries {
                attempts: self.max_attempts,
                last,
            }),
            // max_attempts >= 1, so at least one attempt ran
            None => Err(ResilienceError::CircuitOpen {
                endpoint: endpoint.to_string(),
                retry_after: Duration::ZERO,
                attempts: 0,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resilience::breaker::{BreakerSettings, CircuitState, InMemoryBreakerStore};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(FailureKind);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Classify for TestError {
        fn failure_kind(&self) -> FailureKind {
            self.0
        }
    }

    fn policy(max_attempts: u32, threshold: u32) -> (RetryPolicy, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        let breaker = Arc::new(CircuitBreakerRegistry::new(
            Arc::new(InMemoryBreakerStore::new()),
            BreakerSettings {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(60),
            },
            Arc::new(clock.clone()),
        ));
        let backoff = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2.0);
        (
            RetryPolicy::new(max_attempts, backoff, breaker, Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let (policy, clock) = policy(3, 10);
        let calls = AtomicU32::new(0);

        let result = policy
            .execute("ep", Duration::from_secs(1), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(TestError(FailureKind::Transient))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.recorded_sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (policy, clock) = policy(3, 10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute("ep", Duration::from_secs(1), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(FailureKind::Permanent)) }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.recorded_sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_carry_last_error() {
        let (policy, _clock) = policy(2, 10);

        let result: Result<(), _> = policy
            .execute("ep", Duration::from_secs(1), |_| async {
                Err(TestError(FailureKind::Transient))
            })
            .await;

        match result {
            Err(ResilienceError::ExhaustedRetries { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(last, AttemptFailure::Failed(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let (policy, _clock) = policy(1, 10);

        let result: Result<(), ResilienceError<TestError>> = policy
            .execute("ep", Duration::from_millis(10), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::ExhaustedRetries {
                last: AttemptFailure::TimedOut(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_then_probes_once() {
        let (policy, clock) = policy(1, 2);

        for _ in 0..2 {
            let _: Result<(), _> = policy
                .execute("ep", Duration::from_secs(1), |_| async {
                    Err(TestError(FailureKind::Transient))
                })
                .await;
        }

        let calls = AtomicU32::new(0);
        let rejected: Result<(), _> = policy
            .execute("ep", Duration::from_secs(1), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), TestError>(()) }
            })
            .await;
        assert!(matches!(rejected, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(60));
        let probe: Result<(), TestError> = policy
            .execute("ep", Duration::from_secs(1), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .map_err(|e| match e {
                ResilienceError::Permanent(e) => e,
                other => panic!("unexpected: {other}"),
            });
        assert!(probe.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let state = policy.breaker().snapshot("ep").await.unwrap();
        assert_eq!(state.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_opening_mid_call_stops_retries() {
        let (policy, _clock) = policy(5, 2);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute("ep", Duration::from_secs(1), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(FailureKind::Transient)) }
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::CircuitOpen { attempts: 2, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
