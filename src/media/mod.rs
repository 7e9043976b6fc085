//! Media transcoding state machine
//!
//! A video [`MediaRecord`] moves forward along
//! `queued -> processing -> ready | error` and never regresses. Status events
//! arrive from provider webhooks (at-least-once, possibly out of order) or from
//! a manual confirmation call; both go through [`MediaProcessor::apply_status`],
//! which computes the transition with the pure [`transition`] function and
//! writes it with a compare-and-set on the previous status.
//!
//! Images never carry a video status; events for them are ignored.

pub mod provider;
pub mod signature;

pub use provider::{HttpMediaProvider, MediaProvider};
pub use signature::SIGNATURE_HEADER;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::MediaConfig;
use crate::error::{CastlineErrorTrait, ErrorCategory};
use crate::models::{MediaKind, MediaRecord, VideoStatus};
use crate::storage::SharedMediaRepository;

/// Compare-and-set attempts before giving up on a contended record
const MAX_CAS_ATTEMPTS: u32 = 5;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    /// Signature missing, malformed or wrong. Deliberately uninformative.
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Webhook secret is not configured")]
    SignatureNotConfigured,

    #[error("Malformed media event: {0}")]
    MalformedEvent(String),

    #[error("Invalid provider reference: {0:?}")]
    InvalidProviderRef(String),

    #[error("Invalid delivery base URL '{0}'")]
    InvalidBaseUrl(String),

    #[error("Media '{id}' not found")]
    NotFound { id: String },

    #[error("Media '{provider_ref}' already registered")]
    AlreadyRegistered { provider_ref: String },

    #[error("Provider has no asset '{provider_ref}'")]
    UnknownAsset { provider_ref: String },

    #[error("Media provider error: {0}")]
    Provider(String),

    #[error("Media storage error: {0}")]
    Storage(String),
}

impl MediaError {
    fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

impl CastlineErrorTrait for MediaError {
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::Storage(_))
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidSignature
            | Self::MalformedEvent(_)
            | Self::InvalidProviderRef(_)
            | Self::NotFound { .. }
            | Self::AlreadyRegistered { .. }
            | Self::UnknownAsset { .. } => ErrorCategory::Validation,
            Self::SignatureNotConfigured | Self::InvalidBaseUrl(_) => ErrorCategory::Config,
            Self::Provider(_) => ErrorCategory::Network,
            Self::Storage(_) => ErrorCategory::Storage,
        }
    }
}

// ============================================================================
// Transitions
// ============================================================================

/// Next status for a video currently at `current` receiving `event`
///
/// `None` means the event is a no-op: a replay, an out-of-order older event,
/// or anything arriving after a terminal status. Forward jumps (a `ready`
/// arriving before `processing`) are accepted.
pub fn transition(current: Option<VideoStatus>, event: VideoStatus) -> Option<VideoStatus> {
    match current {
        Some(status) if status.is_terminal() => None,
        Some(status) if event.rank() <= status.rank() => None,
        _ => Some(event),
    }
}

// ============================================================================
// Delivery URLs
// ============================================================================

/// Canonical delivery URLs derived from a provider reference
#[derive(Debug, Clone)]
pub struct DeliveryUrls {
    stream_base: Url,
    image_base: Url,
}

impl DeliveryUrls {
    pub fn new(stream_base: &str, image_base: &str) -> Result<Self, MediaError> {
        let parse = |raw: &str| {
            Url::parse(raw)
                .ok()
                .filter(|u| !u.cannot_be_a_base())
                .ok_or_else(|| MediaError::InvalidBaseUrl(raw.to_string()))
        };
        Ok(Self {
            stream_base: parse(stream_base)?,
            image_base: parse(image_base)?,
        })
    }

    pub fn from_config(config: &MediaConfig) -> Result<Self, MediaError> {
        Self::new(&config.stream_base_url, &config.image_base_url)
    }

    fn derive(base: &Url, segments: &[&str]) -> Result<String, MediaError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| MediaError::InvalidBaseUrl(base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url.to_string())
    }

    /// `{stream}/{ref}/manifest.m3u8`
    pub fn playable_url(&self, provider_ref: &str) -> Result<String, MediaError> {
        Self::derive(&self.stream_base, &[provider_ref, "manifest.m3u8"])
    }

    /// `{image}/{ref}/thumbnail.jpg`
    pub fn thumbnail_url(&self, provider_ref: &str) -> Result<String, MediaError> {
        Self::derive(&self.image_base, &[provider_ref, "thumbnail.jpg"])
    }

    /// `{image}/{ref}`
    pub fn image_url(&self, provider_ref: &str) -> Result<String, MediaError> {
        Self::derive(&self.image_base, &[provider_ref])
    }
}

// ============================================================================
// Webhook events
// ============================================================================

/// Provider webhook payload: `{"type": "...", "data": {"id": "<ref>"}}`
#[derive(Debug, Clone, Deserialize)]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub id: String,
}

impl StatusEvent {
    pub fn parse(body: &[u8]) -> Result<Self, MediaError> {
        serde_json::from_slice(body).map_err(|e| MediaError::MalformedEvent(e.to_string()))
    }

    /// Video status carried by the event, `None` for unrelated event types
    pub fn video_status(&self) -> Option<VideoStatus> {
        match self.event_type.as_str() {
            "video.asset.queued" => Some(VideoStatus::Queued),
            "video.asset.created" => Some(VideoStatus::Processing),
            "video.asset.ready" => Some(VideoStatus::Ready),
            "video.asset.errored" => Some(VideoStatus::Error),
            _ => None,
        }
    }
}

/// Result of applying a status to a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Advanced {
        media_id: String,
        from: Option<VideoStatus>,
        to: VideoStatus,
    },
    /// Replay, stale event or post-terminal event
    Unchanged { media_id: String },
    /// The record is an image
    NotVideo { media_id: String },
    /// No record with this provider reference
    UnknownRef,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Advanced { .. })
    }
}

/// Result of a verified webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied(ApplyOutcome),
    /// Event type this pipeline does not track
    Ignored { event_type: String },
}

impl WebhookOutcome {
    /// Whether the event referred to a known record and was evaluated
    pub fn processed(&self) -> bool {
        matches!(
            self,
            Self::Applied(ApplyOutcome::Advanced { .. } | ApplyOutcome::Unchanged { .. })
        )
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Applied(ApplyOutcome::Advanced { .. }) => "processed",
            Self::Applied(ApplyOutcome::Unchanged { .. }) => "unchanged",
            Self::Applied(ApplyOutcome::UnknownRef) => "unknown",
            Self::Applied(ApplyOutcome::NotVideo { .. }) | Self::Ignored { .. } => "ignored",
        }
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Applies status events and registrations to media records
pub struct MediaProcessor {
    repo: SharedMediaRepository,
    urls: DeliveryUrls,
}

impl MediaProcessor {
    pub fn new(repo: SharedMediaRepository, urls: DeliveryUrls) -> Self {
        Self { repo, urls }
    }

    pub fn urls(&self) -> &DeliveryUrls {
        &self.urls
    }

    /// Register an upload; videos start `queued`, images get a delivery URL
    pub async fn register(
        &self,
        provider_ref: &str,
        kind: MediaKind,
    ) -> Result<MediaRecord, MediaError> {
        let provider_ref = provider_ref.trim();
        if provider_ref.is_empty() || provider_ref.contains('/') {
            return Err(MediaError::InvalidProviderRef(provider_ref.to_string()));
        }

        if self
            .repo
            .find_media_by_provider_ref(provider_ref)
            .await
            .map_err(MediaError::storage)?
            .is_some()
        {
            return Err(MediaError::AlreadyRegistered {
                provider_ref: provider_ref.to_string(),
            });
        }

        let record = match kind {
            MediaKind::Video => MediaRecord {
                id: uuid::Uuid::new_v4().to_string(),
                provider_ref: provider_ref.to_string(),
                kind,
                video_status: Some(VideoStatus::Queued),
                playable_url: None,
                thumbnail_url: None,
            },
            MediaKind::Image => MediaRecord {
                id: uuid::Uuid::new_v4().to_string(),
                provider_ref: provider_ref.to_string(),
                kind,
                video_status: None,
                playable_url: Some(self.urls.image_url(provider_ref)?),
                thumbnail_url: None,
            },
        };

        self.repo
            .insert_media(&record)
            .await
            .map_err(MediaError::storage)?;

        info!(media_id = %record.id, provider_ref, kind = kind.as_str(), "Media registered");
        Ok(record)
    }

    /// Apply `event` to the record identified by `provider_ref`
    ///
    /// Safe to call any number of times with the same event.
    pub async fn apply_status(
        &self,
        provider_ref: &str,
        event: VideoStatus,
    ) -> Result<ApplyOutcome, MediaError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(record) = self
                .repo
                .find_media_by_provider_ref(provider_ref)
                .await
                .map_err(MediaError::storage)?
            else {
                return Ok(ApplyOutcome::UnknownRef);
            };

            if record.kind != MediaKind::Video {
                return Ok(ApplyOutcome::NotVideo {
                    media_id: record.id,
                });
            }

            let Some(next) = transition(record.video_status, event) else {
                debug!(media_id = %record.id, event = %event, "Media event is a no-op");
                return Ok(ApplyOutcome::Unchanged {
                    media_id: record.id,
                });
            };

            let (playable, thumbnail) = if next == VideoStatus::Ready {
                (
                    Some(self.urls.playable_url(provider_ref)?),
                    Some(self.urls.thumbnail_url(provider_ref)?),
                )
            } else {
                (None, None)
            };

            let advanced = self
                .repo
                .advance_video_status(
                    &record.id,
                    record.video_status,
                    next,
                    playable.as_deref(),
                    thumbnail.as_deref(),
                )
                .await
                .map_err(MediaError::storage)?;

            if advanced {
                info!(
                    media_id = %record.id,
                    from = ?record.video_status,
                    to = %next,
                    "Media status advanced"
                );
                return Ok(ApplyOutcome::Advanced {
                    media_id: record.id,
                    from: record.video_status,
                    to: next,
                });
            }
            // Lost the race; re-read and re-evaluate.
        }

        warn!(provider_ref, "Media status update kept losing compare-and-set");
        Err(MediaError::Storage(format!(
            "concurrent updates on media '{provider_ref}'"
        )))
    }

    /// Verify and apply a raw webhook delivery
    pub async fn handle_webhook(
        &self,
        secret: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookOutcome, MediaError> {
        signature::verify(secret, body, signature)?;

        let event = StatusEvent::parse(body)?;
        let Some(status) = event.video_status() else {
            debug!(event_type = %event.event_type, "Ignoring media event type");
            return Ok(WebhookOutcome::Ignored {
                event_type: event.event_type,
            });
        };

        let outcome = self.apply_status(&event.data.id, status).await?;
        if outcome == ApplyOutcome::UnknownRef {
            info!(provider_ref = %event.data.id, "Media event for unknown reference acknowledged");
        }
        Ok(WebhookOutcome::Applied(outcome))
    }

    /// Ask the provider for the current status of `media_id` and apply it
    pub async fn confirm(
        &self,
        media_id: &str,
        provider: &dyn MediaProvider,
    ) -> Result<(ApplyOutcome, MediaRecord), MediaError> {
        let record = self
            .repo
            .get_media(media_id)
            .await
            .map_err(MediaError::storage)?
            .ok_or_else(|| MediaError::NotFound {
                id: media_id.to_string(),
            })?;

        let outcome = if record.kind == MediaKind::Video {
            let status = provider.video_status(&record.provider_ref).await?;
            self.apply_status(&record.provider_ref, status).await?
        } else {
            ApplyOutcome::NotVideo {
                media_id: record.id.clone(),
            }
        };

        let current = self
            .repo
            .get_media(media_id)
            .await
            .map_err(MediaError::storage)?
            .unwrap_or(record);

        Ok((outcome, current))
    }
}
