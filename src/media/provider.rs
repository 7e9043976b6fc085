//! Transcoding provider API client
//!
//! Used by the manual confirmation path to ask the provider for the current
//! status of an asset instead of waiting for a webhook.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::MediaError;
use crate::config::MediaConfig;
use crate::models::VideoStatus;

/// Status lookup against the transcoding provider
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn video_status(&self, provider_ref: &str) -> Result<VideoStatus, MediaError>;
}

#[derive(Deserialize)]
struct AssetResponse {
    data: AssetData,
}

#[derive(Deserialize)]
struct AssetData {
    status: String,
}

/// Map a provider asset status string
pub fn parse_asset_status(status: &str) -> Option<VideoStatus> {
    match status {
        "waiting" | "queued" => Some(VideoStatus::Queued),
        "preparing" | "processing" => Some(VideoStatus::Processing),
        "ready" => Some(VideoStatus::Ready),
        "errored" | "error" => Some(VideoStatus::Error),
        _ => None,
    }
}

/// HTTP client for `GET {api}/video/v1/assets/{ref}`
pub struct HttpMediaProvider {
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl HttpMediaProvider {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Result<Self, MediaError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MediaError::Provider(e.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// `None` when no provider API is configured
    pub fn from_config(config: &MediaConfig) -> Result<Option<Self>, MediaError> {
        config
            .provider_api_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.provider_token.clone()))
            .transpose()
    }
}

#[async_trait]
impl MediaProvider for HttpMediaProvider {
    async fn video_status(&self, provider_ref: &str) -> Result<VideoStatus, MediaError> {
        let url = format!("{}/video/v1/assets/{}", self.api_url, provider_ref);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MediaError::Provider(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(MediaError::UnknownAsset {
                provider_ref: provider_ref.to_string(),
            });
        }
        if !status.is_success() {
            return Err(MediaError::Provider(format!("provider answered {status}")));
        }

        let body: AssetResponse = response
            .json()
            .await
            .map_err(|e| MediaError::Provider(format!("invalid asset response: {e}")))?;

        parse_asset_status(&body.data.status)
            .ok_or_else(|| MediaError::Provider(format!("unknown asset status '{}'", body.data.status)))
    }
}
