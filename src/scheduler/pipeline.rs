//! Per-item publish path
//!
//! Shared by the due-cast scheduler and the publish-now endpoint:
//!
//! 1. Reserve the item's idempotency key (`cast:<id>`). A recorded outcome is
//!    replayed without calling the upstream; a live reservation held by
//!    someone else skips the item.
//! 2. Claim the item (`-> publishing`) before any outbound call.
//! 3. Resolve attachments and the account credential.
//! 4. Call the upstream through the [`RetryPolicy`].
//! 5. Record the outcome: `published`, `retrying` with backoff, or `failed`.
//!
//! Only store failures surface as errors; every upstream outcome is an
//! [`ItemOutcome`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::{SchedulerError, SchedulerResult};
use crate::clock::{to_chrono, SharedClock};
use crate::config::Config;
use crate::idempotency::{IdempotencyStore, Lookup};
use crate::models::{Attachment, MediaKind, ScheduledItem, VideoStatus};
use crate::publish::{CredentialSource, PublishError, PublishReceipt, PublishRequest, Publisher};
use crate::resilience::{BackoffPolicy, Classify, FailureKind, ResilienceError, RetryPolicy};
use crate::storage::{SharedItemRepository, SharedMediaRepository};

/// Tunables of the per-item path
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Circuit breaker key of the publish endpoint
    pub endpoint_key: String,
    /// Item-level retry budget (scheduler runs, not call attempts)
    pub max_retries: u32,
    /// Delay before an item in `retrying` becomes due again
    pub item_backoff: BackoffPolicy,
    pub idempotency_ttl: Duration,
    pub reservation_ttl: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint_key: config.upstream.endpoint_key.clone(),
            max_retries: config.scheduler.max_retries,
            item_backoff: BackoffPolicy::for_items(&config.scheduler),
            idempotency_ttl: Duration::from_secs(config.idempotency.ttl_secs),
            reservation_ttl: Duration::from_secs(config.idempotency.reservation_ttl_secs),
        }
    }
}

/// Why an item was left untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another caller holds the item's publish reservation
    InProgress,
    /// The item was no longer claimable when we tried
    NotClaimable,
}

/// Outcome of processing one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Published {
        external_ref: String,
        /// Answered from a recorded outcome without an upstream call
        replayed: bool,
    },
    Retrying {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        error: String,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl ItemOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Failure of one publish attempt, before or during the upstream call
#[derive(Debug)]
enum AttemptError {
    /// Attachments or credential could not be resolved
    Precondition(PublishError),
    Call(ResilienceError<PublishError>),
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Precondition(e) => e.failure_kind() == FailureKind::Transient,
            Self::Call(e) => e.is_transient(),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precondition(e) => write!(f, "{e}"),
            Self::Call(e) => write!(f, "{e}"),
        }
    }
}

/// The per-item publish path
pub struct PublishPipeline {
    items: SharedItemRepository,
    media: SharedMediaRepository,
    idempotency: Arc<dyn IdempotencyStore>,
    publisher: Arc<dyn Publisher>,
    credentials: Arc<dyn CredentialSource>,
    retry: Arc<RetryPolicy>,
    clock: SharedClock,
    settings: PipelineSettings,
}

impl PublishPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        items: SharedItemRepository,
        media: SharedMediaRepository,
        idempotency: Arc<dyn IdempotencyStore>,
        publisher: Arc<dyn Publisher>,
        credentials: Arc<dyn CredentialSource>,
        retry: Arc<RetryPolicy>,
        clock: SharedClock,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            items,
            media,
            idempotency,
            publisher,
            credentials,
            retry,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Take `item` through one publish attempt
    pub async fn process(
        &self,
        item: &ScheduledItem,
        per_call_timeout: Duration,
    ) -> SchedulerResult<ItemOutcome> {
        let key = item.publish_key();

        let lookup = self
            .idempotency
            .get_or_reserve(&key, self.settings.reservation_ttl)
            .await
            .map_err(|e| SchedulerError::idempotency_store("reserve", e))?;

        match lookup {
            Lookup::Found(record) => return self.replay(item, &record.data).await,
            Lookup::InProgress => {
                debug!(item_id = %item.id, "Publish already in progress elsewhere");
                return Ok(ItemOutcome::Skipped {
                    reason: SkipReason::InProgress,
                });
            }
            Lookup::Reserved => {}
        }

        let claimed = match self.items.claim(&item.id, self.clock.now()).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.release(&key).await;
                return Err(SchedulerError::storage("claim item", e));
            }
        };
        if !claimed {
            self.release(&key).await;
            debug!(item_id = %item.id, "Item no longer claimable");
            return Ok(ItemOutcome::Skipped {
                reason: SkipReason::NotClaimable,
            });
        }

        match self.attempt(item, &key, per_call_timeout).await {
            Ok(receipt) => self.on_success(item, &key, receipt).await,
            Err(err) => {
                self.release(&key).await;
                self.on_failure(item, err).await
            }
        }
    }

    /// Mark `item` published from a previously recorded receipt
    async fn replay(&self, item: &ScheduledItem, data: &str) -> SchedulerResult<ItemOutcome> {
        let receipt = serde_json::from_str::<PublishReceipt>(data);

        let claimed = self
            .items
            .claim(&item.id, self.clock.now())
            .await
            .map_err(|e| SchedulerError::storage("claim item", e))?;
        if !claimed {
            return Ok(ItemOutcome::Skipped {
                reason: SkipReason::NotClaimable,
            });
        }

        // The upstream may already hold this post, so never publish again
        // under an unreadable record; surface it on the item instead.
        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(e) => {
                let error = format!("recorded publish outcome is unreadable: {e}");
                warn!(item_id = %item.id, error = %error, "Failing item with unreadable record");
                self.items
                    .mark_failed(&item.id, &error, self.clock.now())
                    .await
                    .map_err(|e| SchedulerError::storage("mark failed", e))?;
                return Ok(ItemOutcome::Failed { error });
            }
        };

        self.items
            .mark_published(&item.id, &receipt.external_ref, self.clock.now())
            .await
            .map_err(|e| SchedulerError::storage("mark published", e))?;

        info!(item_id = %item.id, external_ref = %receipt.external_ref, "Replayed recorded publish");
        crate::metrics::record_idempotency_replay("scheduler");

        Ok(ItemOutcome::Published {
            external_ref: receipt.external_ref,
            replayed: true,
        })
    }

    async fn attempt(
        &self,
        item: &ScheduledItem,
        key: &str,
        per_call_timeout: Duration,
    ) -> Result<PublishReceipt, AttemptError> {
        let attachments = self.resolve_attachments(item).await?;

        let credential = self
            .credentials
            .credential_for(&item.owner_ref)
            .await
            .map_err(|e| AttemptError::Precondition(PublishError::Connection(format!("{e:#}"))))?
            .ok_or_else(|| {
                AttemptError::Precondition(PublishError::MissingCredential {
                    owner_ref: item.owner_ref.clone(),
                })
            })?;

        let request = PublishRequest {
            credential,
            content: item.payload.content.clone(),
            destination: item.payload.destination.clone(),
            parent_ref: item.payload.parent_ref.clone(),
            attachments,
            idempotency_key: key.to_string(),
        };

        self.retry
            .execute(&self.settings.endpoint_key, per_call_timeout, |attempt| {
                debug!(item_id = %item.id, attempt, "Calling upstream publish");
                self.publisher.publish(&request)
            })
            .await
            .map_err(AttemptError::Call)
    }

    /// Resolve attachments to delivery URLs
    ///
    /// A video still transcoding is a retryable precondition failure; a
    /// missing or errored record is permanent.
    async fn resolve_attachments(&self, item: &ScheduledItem) -> Result<Vec<String>, AttemptError> {
        let mut urls = Vec::with_capacity(item.payload.attachments.len());

        for attachment in &item.payload.attachments {
            let media_id = match attachment {
                Attachment::Url { url } => {
                    urls.push(url.clone());
                    continue;
                }
                Attachment::Media { media_id } => media_id,
            };

            let record = self
                .media
                .get_media(media_id)
                .await
                .map_err(|e| AttemptError::Precondition(PublishError::Connection(format!("{e:#}"))))?
                .ok_or_else(|| {
                    AttemptError::Precondition(PublishError::MediaUnavailable {
                        media_id: media_id.clone(),
                        reason: "media record does not exist".to_string(),
                    })
                })?;

            if record.kind == MediaKind::Video && record.video_status == Some(VideoStatus::Error) {
                return Err(AttemptError::Precondition(PublishError::MediaUnavailable {
                    media_id: media_id.clone(),
                    reason: "transcoding failed".to_string(),
                }));
            }

            match record.playable_url {
                Some(url) if record.is_publishable() => urls.push(url),
                _ => {
                    return Err(AttemptError::Precondition(PublishError::MediaNotReady {
                        media_id: media_id.clone(),
                    }))
                }
            }
        }

        Ok(urls)
    }

    async fn on_success(
        &self,
        item: &ScheduledItem,
        key: &str,
        receipt: PublishReceipt,
    ) -> SchedulerResult<ItemOutcome> {
        let data = serde_json::to_string(&receipt)?;
        if let Err(e) = self
            .idempotency
            .record(key, 200, &data, self.settings.idempotency_ttl)
            .await
        {
            // The post exists upstream; the item state below is what matters.
            warn!(item_id = %item.id, error = %format!("{e:#}"), "Failed to record publish outcome");
        }

        let now = self.clock.now();
        let updated = self
            .items
            .mark_published(&item.id, &receipt.external_ref, now)
            .await
            .map_err(|e| SchedulerError::storage("mark published", e))?;
        if !updated {
            warn!(item_id = %item.id, "Item left publishing before it could be marked published");
        }

        info!(item_id = %item.id, external_ref = %receipt.external_ref, "Item published");
        Ok(ItemOutcome::Published {
            external_ref: receipt.external_ref,
            replayed: false,
        })
    }

    async fn on_failure(
        &self,
        item: &ScheduledItem,
        err: AttemptError,
    ) -> SchedulerResult<ItemOutcome> {
        let now = self.clock.now();
        let message = err.to_string();

        if err.is_transient() && item.retry_count < self.settings.max_retries {
            let retry_count = item.retry_count + 1;
            let next_attempt_at = now + to_chrono(self.settings.item_backoff.delay(retry_count));

            self.items
                .mark_retrying(&item.id, retry_count, next_attempt_at, &message, now)
                .await
                .map_err(|e| SchedulerError::storage("mark retrying", e))?;

            warn!(
                item_id = %item.id,
                retry_count,
                next_attempt_at = %next_attempt_at,
                error = %message,
                "Publish failed transiently, item will be retried"
            );
            return Ok(ItemOutcome::Retrying {
                retry_count,
                next_attempt_at,
                error: message,
            });
        }

        let error = if err.is_transient() {
            format!(
                "retry budget exhausted after {} retries: {message}",
                item.retry_count
            )
        } else {
            message
        };

        self.items
            .mark_failed(&item.id, &error, now)
            .await
            .map_err(|e| SchedulerError::storage("mark failed", e))?;

        warn!(item_id = %item.id, error = %error, "Item failed");
        Ok(ItemOutcome::Failed { error })
    }

    async fn release(&self, key: &str) {
        if let Err(e) = self.idempotency.release(key).await {
            warn!(key, error = %format!("{e:#}"), "Failed to release publish reservation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SharedSleeper};
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::models::{ItemStatus, MediaRecord, PostPayload};
    use crate::publish::StaticCredentials;
    use crate::resilience::{BreakerSettings, CircuitBreakerRegistry, InMemoryBreakerStore};
    use crate::storage::{InMemoryStore, ItemRepository, MediaRepository};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedPublisher {
        script: Mutex<VecDeque<Result<PublishReceipt, PublishError>>>,
        calls: Mutex<Vec<PublishRequest>>,
    }

    impl ScriptedPublisher {
        fn new(script: Vec<Result<PublishReceipt, PublishError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<PublishRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Publisher for ScriptedPublisher {
        async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
            self.calls.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(PublishError::Timeout))
        }
    }

    fn ok(hash: &str) -> Result<PublishReceipt, PublishError> {
        Ok(PublishReceipt {
            external_ref: hash.to_string(),
        })
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        idempotency: Arc<InMemoryIdempotencyStore>,
        publisher: Arc<ScriptedPublisher>,
        pipeline: PublishPipeline,
    }

    fn fixture(script: Vec<Result<PublishReceipt, PublishError>>, max_retries: u32) -> Fixture {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(InMemoryStore::new());
        let idempotency = Arc::new(InMemoryIdempotencyStore::new(clock.clone()));
        let publisher = Arc::new(ScriptedPublisher::new(script));

        let breaker = Arc::new(CircuitBreakerRegistry::new(
            Arc::new(InMemoryBreakerStore::new()),
            BreakerSettings {
                failure_threshold: 10,
                cooldown: Duration::from_secs(30),
            },
            clock.clone(),
        ));
        let sleeper: SharedSleeper = clock.clone();
        let retry = Arc::new(RetryPolicy::new(
            1,
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2.0),
            breaker,
            sleeper,
        ));

        let settings = PipelineSettings {
            endpoint_key: "upstream:test".to_string(),
            max_retries,
            item_backoff: BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(3600), 2.0),
            idempotency_ttl: Duration::from_secs(3600),
            reservation_ttl: Duration::from_secs(60),
        };

        let pipeline = PublishPipeline::new(
            store.clone(),
            store.clone(),
            idempotency.clone(),
            publisher.clone(),
            Arc::new(StaticCredentials::new(Default::default(), Some("token".to_string()))),
            retry,
            clock.clone(),
            settings,
        );

        Fixture {
            clock,
            store,
            idempotency,
            publisher,
            pipeline,
        }
    }

    async fn due_item(f: &Fixture, id: &str, payload: PostPayload) -> ScheduledItem {
        let at = f.clock.now() - chrono::Duration::seconds(1);
        let item = ScheduledItem::scheduled("acct", payload, at).with_id(id);
        f.store.create_item(&item).await.unwrap();
        item
    }

    #[tokio::test]
    async fn test_success_publishes_and_records() {
        let f = fixture(vec![ok("0xabc")], 3);
        let item = due_item(&f, "a", PostPayload::default()).await;

        let outcome = f.pipeline.process(&item, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            outcome,
            ItemOutcome::Published {
                external_ref: "0xabc".to_string(),
                replayed: false
            }
        );

        let stored = f.store.get_item("a").await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Published);
        assert_eq!(stored.external_ref.as_deref(), Some("0xabc"));
        assert_eq!(f.publisher.calls()[0].idempotency_key, "cast:a");
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let f = fixture(vec![Err(PublishError::Timeout)], 3);
        let item = due_item(&f, "b", PostPayload::default()).await;

        let outcome = f.pipeline.process(&item, Duration::from_secs(5)).await.unwrap();
        let expected_at = f.clock.now() + chrono::Duration::seconds(60);
        assert_eq!(outcome.label(), "retrying");

        let stored = f.store.get_item("b").await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Retrying);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.scheduled_at, expected_at);

        // The reservation was released so the next run can try again
        assert_eq!(
            f.idempotency
                .get_or_reserve("cast:b", Duration::from_secs(1))
                .await
                .unwrap(),
            Lookup::Reserved
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_immediately() {
        let f = fixture(
            vec![Err(PublishError::Rejected {
                status: 400,
                message: "text too long".to_string(),
            })],
            3,
        );
        let item = due_item(&f, "c", PostPayload::default()).await;

        f.pipeline.process(&item, Duration::from_secs(5)).await.unwrap();

        let stored = f.store.get_item("c").await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Failed);
        assert!(stored.error_message.unwrap().contains("text too long"));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let f = fixture(vec![Err(PublishError::RateLimited)], 2);
        let mut item = due_item(&f, "d", PostPayload::default()).await;
        item.retry_count = 2;

        let outcome = f.pipeline.process(&item, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.label(), "failed");

        let stored = f.store.get_item("d").await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains("retry budget exhausted"));
    }

    #[tokio::test]
    async fn test_recorded_outcome_is_replayed_without_call() {
        let f = fixture(vec![], 3);
        let item = due_item(&f, "e", PostPayload::default()).await;
        f.idempotency
            .record("cast:e", 200, r#"{"external_ref":"0xfeed"}"#, Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = f.pipeline.process(&item, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            outcome,
            ItemOutcome::Published {
                external_ref: "0xfeed".to_string(),
                replayed: true
            }
        );
        assert!(f.publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_record_fails_item_without_call() {
        let f = fixture(vec![ok("0x1")], 3);
        let item = due_item(&f, "g", PostPayload::default()).await;
        f.idempotency
            .record("cast:g", 200, r#"{"success":true}"#, Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = f.pipeline.process(&item, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.label(), "failed");
        assert!(f.publisher.calls().is_empty());

        let stored = f.store.get_item("g").await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Failed);
        assert!(stored.error_message.unwrap().contains("unreadable"));
    }

    #[tokio::test]
    async fn test_live_reservation_skips_item() {
        let f = fixture(vec![ok("0x1")], 3);
        let item = due_item(&f, "f", PostPayload::default()).await;
        f.idempotency
            .get_or_reserve("cast:f", Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = f.pipeline.process(&item, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            outcome,
            ItemOutcome::Skipped {
                reason: SkipReason::InProgress
            }
        );
        let stored = f.store.get_item("f").await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_video_not_ready_is_retryable() {
        let f = fixture(vec![ok("0x2")], 3);
        f.store
            .insert_media(&MediaRecord {
                id: "m1".to_string(),
                provider_ref: "asset".to_string(),
                kind: MediaKind::Video,
                video_status: Some(VideoStatus::Processing),
                playable_url: None,
                thumbnail_url: None,
            })
            .await
            .unwrap();

        let payload = PostPayload {
            content: "clip".to_string(),
            attachments: vec![Attachment::Media {
                media_id: "m1".to_string(),
            }],
            ..PostPayload::default()
        };
        let item = due_item(&f, "g", payload).await;

        let outcome = f.pipeline.process(&item, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.label(), "retrying");
        assert!(f.publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_media_fails_permanently() {
        let f = fixture(vec![ok("0x3")], 3);
        let payload = PostPayload {
            attachments: vec![Attachment::Media {
                media_id: "nope".to_string(),
            }],
            ..PostPayload::default()
        };
        let item = due_item(&f, "h", payload).await;

        let outcome = f.pipeline.process(&item, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.label(), "failed");
    }

    #[tokio::test]
    async fn test_url_attachments_pass_through() {
        let f = fixture(vec![ok("0x4")], 3);
        let payload = PostPayload {
            attachments: vec![Attachment::Url {
                url: "https://example.org/a.png".to_string(),
            }],
            ..PostPayload::default()
        };
        let item = due_item(&f, "i", payload).await;

        f.pipeline.process(&item, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            f.publisher.calls()[0].attachments,
            vec!["https://example.org/a.png".to_string()]
        );
    }
}
