// Core data structures for the publish pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Scheduled Items
// ============================================================================

/// Lifecycle status of a scheduled item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Draft,
    Scheduled,
    Publishing,
    Published,
    Failed,
    Retrying,
}

impl ItemStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    /// Statuses the scheduler selects when `scheduled_at` has passed
    pub fn due_statuses() -> [Self; 2] {
        [Self::Scheduled, Self::Retrying]
    }

    /// Whether a publish attempt may claim an item in this status
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Draft | Self::Scheduled | Self::Retrying)
    }

    /// Published and failed items are never re-selected
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "publishing" => Ok(Self::Publishing),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            other => Err(format!("unknown item status: {other}")),
        }
    }
}

/// Something attached to a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    /// Uploaded media resolved through a [`MediaRecord`] at publish time
    Media {
        #[serde(rename = "mediaId")]
        media_id: String,
    },
    /// Plain link embed
    Url { url: String },
}

/// Content and routing of a post
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPayload {
    pub content: String,
    /// Destination channel on the upstream network
    pub destination: String,
    /// Parent post for threaded replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A unit of work to publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledItem {
    pub id: String,
    pub owner_ref: String,
    pub payload: PostPayload,
    pub status: ItemStatus,
    pub scheduled_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub external_ref: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// When the item last entered `publishing`
    pub claimed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledItem {
    /// Create a new item in `scheduled` status
    pub fn scheduled(
        owner_ref: impl Into<String>,
        payload: PostPayload,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_ref: owner_ref.into(),
            payload,
            status: ItemStatus::Scheduled,
            scheduled_at,
            published_at: None,
            external_ref: None,
            error_message: None,
            retry_count: 0,
            claimed_at: None,
            updated_at: scheduled_at,
        }
    }

    /// Builder-style override of the identifier
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Idempotency key carried by every outbound publish of this item
    pub fn publish_key(&self) -> String {
        format!("cast:{}", self.id)
    }

    /// Whether the scheduler should pick this item up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        ItemStatus::due_statuses().contains(&self.status) && self.scheduled_at <= now
    }
}

// ============================================================================
// Cron Runs
// ============================================================================

/// Aggregate counters of one scheduler run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub published: u32,
    pub failed: u32,
    pub retrying: u32,
    /// Due items left for the next run (budget exhausted or claimed elsewhere)
    pub skipped: u32,
    /// Items that reached an outcome in this run
    pub processed: u32,
}

/// One execution record of the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronRun {
    pub id: String,
    pub job_name: String,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub counts: RunCounts,
    pub error_message: Option<String>,
}

impl CronRun {
    /// Whether the run has not been finalized yet
    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }
}

// ============================================================================
// Media
// ============================================================================

/// Kind of uploaded media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

/// Transcoding status of a video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Queued,
    Processing,
    Ready,
    Error,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    /// Position along queued -> processing -> ready|error
    pub fn rank(&self) -> u8 {
        match self {
            Self::Queued => 1,
            Self::Processing => 2,
            Self::Ready | Self::Error => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VideoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown video status: {other}")),
        }
    }
}

/// An attachment awaiting or having completed transcoding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRecord {
    pub id: String,
    pub provider_ref: String,
    pub kind: MediaKind,
    /// Always `None` for images
    pub video_status: Option<VideoStatus>,
    pub playable_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl MediaRecord {
    /// Whether the record can be embedded in a post right now
    pub fn is_publishable(&self) -> bool {
        match self.kind {
            MediaKind::Image => self.playable_url.is_some(),
            MediaKind::Video => {
                self.video_status == Some(VideoStatus::Ready) && self.playable_url.is_some()
            }
        }
    }
}

// ============================================================================
// Idempotency
// ============================================================================

/// Recorded outcome of a side-effecting call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    /// HTTP-like status code of the recorded outcome
    pub status: u16,
    /// Response body, replayed verbatim
    pub data: String,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_item_status_roundtrip_strings() {
        for status in [
            ItemStatus::Draft,
            ItemStatus::Scheduled,
            ItemStatus::Publishing,
            ItemStatus::Published,
            ItemStatus::Failed,
            ItemStatus::Retrying,
        ] {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ItemStatus::Published.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::Retrying.is_terminal());
        assert!(!ItemStatus::Publishing.is_claimable());
    }

    #[test]
    fn test_item_is_due() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut item = ScheduledItem::scheduled(
            "acct-1",
            PostPayload::default(),
            now - chrono::Duration::seconds(1),
        );
        assert!(item.is_due(now));

        item.status = ItemStatus::Published;
        assert!(!item.is_due(now));

        item.status = ItemStatus::Retrying;
        item.scheduled_at = now + chrono::Duration::minutes(5);
        assert!(!item.is_due(now));
    }

    #[test]
    fn test_publish_key_is_stable() {
        let item = ScheduledItem::scheduled("acct-1", PostPayload::default(), Utc::now())
            .with_id("item-42");
        assert_eq!(item.publish_key(), "cast:item-42");
    }

    #[test]
    fn test_video_status_rank_is_forward_only() {
        assert!(VideoStatus::Queued.rank() < VideoStatus::Processing.rank());
        assert!(VideoStatus::Processing.rank() < VideoStatus::Ready.rank());
        assert_eq!(VideoStatus::Ready.rank(), VideoStatus::Error.rank());
    }

    #[test]
    fn test_attachment_serialization_is_tagged() {
        let attachment = Attachment::Media {
            media_id: "m-1".to_string(),
        };
        let json = serde_json::to_string(&attachment).unwrap();
        assert_eq!(json, r#"{"type":"media","mediaId":"m-1"}"#);
    }

    #[test]
    fn test_media_publishable() {
        let mut media = MediaRecord {
            id: "m-1".to_string(),
            provider_ref: "asset-1".to_string(),
            kind: MediaKind::Video,
            video_status: Some(VideoStatus::Processing),
            playable_url: None,
            thumbnail_url: None,
        };
        assert!(!media.is_publishable());

        media.video_status = Some(VideoStatus::Ready);
        media.playable_url = Some("https://stream.example/asset-1.m3u8".to_string());
        assert!(media.is_publishable());
    }
}
