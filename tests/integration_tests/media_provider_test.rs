//! Manual media confirmation against a mock provider API

use castline::media::{
    ApplyOutcome, DeliveryUrls, HttpMediaProvider, MediaError, MediaProcessor, MediaProvider,
};
use castline::models::{MediaKind, VideoStatus};
use castline::storage::InMemoryStore;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn processor() -> MediaProcessor {
    let urls = DeliveryUrls::new("https://stream.test", "https://image.test").unwrap();
    MediaProcessor::new(Arc::new(InMemoryStore::new()), urls)
}

async fn mock_asset(server: &MockServer, provider_ref: &str, status: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/video/v1/assets/{provider_ref}")))
        .and(header("authorization", "Bearer provider-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "status": status } })),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_provider_status_lookup() {
    let mock_server = MockServer::start().await;
    mock_asset(&mock_server, "asset-1", "preparing").await;

    let provider =
        HttpMediaProvider::new(mock_server.uri(), Some("provider-token".to_string())).unwrap();

    assert_eq!(
        provider.video_status("asset-1").await.unwrap(),
        VideoStatus::Processing
    );
}

#[tokio::test]
async fn test_unknown_asset_maps_to_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/video/v1/assets/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let provider = HttpMediaProvider::new(mock_server.uri(), None).unwrap();
    let err = provider.video_status("missing").await.unwrap_err();

    assert!(matches!(err, MediaError::UnknownAsset { .. }));
}

#[tokio::test]
async fn test_confirm_advances_record_to_ready() {
    let mock_server = MockServer::start().await;
    mock_asset(&mock_server, "asset-1", "ready").await;
    let provider =
        HttpMediaProvider::new(mock_server.uri(), Some("provider-token".to_string())).unwrap();

    let processor = processor();
    let record = processor.register("asset-1", MediaKind::Video).await.unwrap();

    let (outcome, updated) = processor.confirm(&record.id, &provider).await.unwrap();
    assert!(matches!(
        outcome,
        ApplyOutcome::Advanced {
            to: VideoStatus::Ready,
            ..
        }
    ));
    assert_eq!(updated.video_status, Some(VideoStatus::Ready));
    assert_eq!(
        updated.playable_url.as_deref(),
        Some("https://stream.test/asset-1/manifest.m3u8")
    );
    assert!(updated.is_publishable());

    // Confirming again changes nothing
    let (outcome, _) = processor.confirm(&record.id, &provider).await.unwrap();
    assert!(!outcome.changed());
}

#[tokio::test]
async fn test_provider_outage_is_recoverable() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&mock_server)
        .await;

    let provider = HttpMediaProvider::new(mock_server.uri(), None).unwrap();
    let processor = processor();
    let record = processor.register("asset-2", MediaKind::Video).await.unwrap();

    let err = processor.confirm(&record.id, &provider).await.unwrap_err();
    assert!(matches!(err, MediaError::Provider(_)));
}
