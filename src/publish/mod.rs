//! Upstream publish call
//!
//! The social-graph publishing API is consumed through the [`Publisher`]
//! trait. [`HttpPublisher`] speaks its HTTP contract; every request carries
//! the item's idempotency key in an `Idempotency-Key` header so the upstream
//! can deduplicate a retry of a call that timed out after it was accepted.
//!
//! [`PublishError`] classifies failures for the retry policy: timeouts,
//! connection failures, rate limits and 5xx are transient, everything else
//! the upstream answers with is permanent.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::{CastlineErrorTrait, ErrorCategory};
use crate::resilience::{Classify, FailureKind};

/// Header carrying the idempotency key on outbound publishes
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Errors returned by a publish attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Request timed out
    #[error("Upstream request timed out")]
    Timeout,

    /// Connection could not be established or was dropped
    #[error("Upstream connection failed: {0}")]
    Connection(String),

    /// Upstream asked us to slow down
    #[error("Rate limited by upstream")]
    RateLimited,

    /// Upstream failed on its side (5xx, 408, 425)
    #[error("Upstream server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Upstream refused the request (validation, auth)
    #[error("Upstream rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// No credential is configured for the owning account
    #[error("No publishing credential for account '{owner_ref}'")]
    MissingCredential { owner_ref: String },

    /// Attached video is still transcoding
    #[error("Media '{media_id}' is not ready yet")]
    MediaNotReady { media_id: String },

    /// Attached media failed transcoding or does not exist
    #[error("Media '{media_id}' cannot be published: {reason}")]
    MediaUnavailable { media_id: String, reason: String },

    /// Upstream accepted the request but the response could not be read
    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl PublishError {
    /// Map a non-success HTTP status to an error
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = upstream_message(body);
        match status.as_u16() {
            429 => Self::RateLimited,
            408 | 425 => Self::Server {
                status: status.as_u16(),
                message,
            },
            s if status.is_server_error() => Self::Server { status: s, message },
            s => Self::Rejected { status: s, message },
        }
    }

    /// Map a transport error
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Connection(err.to_string())
        }
    }
}

/// Pull a human-readable message out of an upstream error body
fn upstream_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        error: Option<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            message: Some(m), ..
        })
        | Ok(ErrorBody { error: Some(m), .. }) => m,
        _ => body.chars().take(500).collect(),
    }
}

impl Classify for PublishError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout
            | Self::Connection(_)
            | Self::RateLimited
            | Self::Server { .. }
            | Self::MediaNotReady { .. } => FailureKind::Transient,
            Self::Rejected { .. }
            | Self::MissingCredential { .. }
            | Self::MediaUnavailable { .. }
            | Self::InvalidResponse(_) => FailureKind::Permanent,
        }
    }
}

impl CastlineErrorTrait for PublishError {
    fn is_recoverable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingCredential { .. } => ErrorCategory::Config,
            Self::MediaNotReady { .. } | Self::MediaUnavailable { .. } => ErrorCategory::Media,
            Self::Rejected { .. } => ErrorCategory::Validation,
            _ => ErrorCategory::Network,
        }
    }
}

/// One outbound publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    /// Bearer credential of the owning account
    pub credential: String,
    pub content: String,
    pub destination: String,
    pub parent_ref: Option<String>,
    /// Resolved attachment URLs
    pub attachments: Vec<String>,
    pub idempotency_key: String,
}

/// Upstream acknowledgement of a publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub external_ref: String,
}

/// Upstream publishing API
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError>;
}

#[derive(Serialize)]
struct CastBody<'a> {
    text: &'a str,
    channel: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<&'a str>,
    embeds: Vec<Embed<'a>>,
}

#[derive(Serialize)]
struct Embed<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct CastResponse {
    cast: CastRef,
}

#[derive(Deserialize)]
struct CastRef {
    hash: String,
}

/// HTTP client for the publishing API
///
/// `POST {base_url}/v1/casts` with a bearer credential; a `2xx` response
/// carries `{"cast": {"hash": "..."}}`.
pub struct HttpPublisher {
    client: Client,
    base_url: String,
}

impl HttpPublisher {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("castline/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> anyhow::Result<Self> {
        Self::new(config.base_url.clone())
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        let url = format!("{}/v1/casts", self.base_url);
        let body = CastBody {
            text: &request.content,
            channel: &request.destination,
            parent: request.parent_ref.as_deref(),
            embeds: request.attachments.iter().map(|url| Embed { url }).collect(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&request.credential)
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "Upstream publish failed");
            return Err(PublishError::from_status(status, &text));
        }

        let parsed: CastResponse = response
            .json()
            .await
            .map_err(|e| PublishError::InvalidResponse(e.to_string()))?;

        Ok(PublishReceipt {
            external_ref: parsed.cast.hash,
        })
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Resolves the publishing credential of an account
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credential_for(&self, owner_ref: &str) -> anyhow::Result<Option<String>>;
}

/// Credentials from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    by_owner: HashMap<String, String>,
    default: Option<String>,
}

impl StaticCredentials {
    pub fn new(by_owner: HashMap<String, String>, default: Option<String>) -> Self {
        Self { by_owner, default }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(config.credentials.clone(), config.default_credential.clone())
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credential_for(&self, owner_ref: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .by_owner
            .get(owner_ref)
            .or(self.default.as_ref())
            .cloned())
    }
}
