//! Upstream publisher tests against a mock publishing API

use castline::publish::{HttpPublisher, PublishError, PublishRequest, Publisher};
use castline::resilience::{Classify, FailureKind};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> PublishRequest {
    PublishRequest {
        credential: "token-abc".to_string(),
        content: "hello world".to_string(),
        destination: "general".to_string(),
        parent_ref: Some("0xparent".to_string()),
        attachments: vec!["https://stream.castline.dev/a1/manifest.m3u8".to_string()],
        idempotency_key: "cast:item-1".to_string(),
    }
}

#[tokio::test]
async fn test_publish_sends_key_credential_and_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/casts"))
        .and(header("authorization", "Bearer token-abc"))
        .and(header("idempotency-key", "cast:item-1"))
        .and(body_json(json!({
            "text": "hello world",
            "channel": "general",
            "parent": "0xparent",
            "embeds": [{ "url": "https://stream.castline.dev/a1/manifest.m3u8" }]
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "cast": { "hash": "0xabc" } })),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let publisher = HttpPublisher::new(format!("{}/", mock_server.uri())).unwrap();
    let receipt = publisher.publish(&request()).await.unwrap();

    assert_eq!(receipt.external_ref, "0xabc");
}

#[tokio::test]
async fn test_publish_error_classification() {
    let mock_server = MockServer::start().await;
    let publisher = HttpPublisher::new(mock_server.uri()).unwrap();

    let cases = [
        (429, FailureKind::Transient),
        (503, FailureKind::Transient),
        (400, FailureKind::Permanent),
        (401, FailureKind::Permanent),
    ];

    for (status, expected) in cases {
        mock_server.reset().await;
        Mock::given(method("POST"))
            .and(path("/v1/casts"))
            .respond_with(
                ResponseTemplate::new(status).set_body_json(json!({ "message": "nope" })),
            )
            .mount(&mock_server)
            .await;

        let err = publisher.publish(&request()).await.unwrap_err();
        assert_eq!(err.failure_kind(), expected, "status {status}");
    }
}

#[tokio::test]
async fn test_rejection_carries_upstream_message() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/casts"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({ "message": "text too long" })),
        )
        .mount(&mock_server)
        .await;

    let publisher = HttpPublisher::new(mock_server.uri()).unwrap();
    let err = publisher.publish(&request()).await.unwrap_err();

    assert_eq!(
        err,
        PublishError::Rejected {
            status: 422,
            message: "text too long".to_string()
        }
    );
}

#[tokio::test]
async fn test_unreadable_success_body_is_invalid_response() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/casts"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&mock_server)
        .await;

    let publisher = HttpPublisher::new(mock_server.uri()).unwrap();
    let err = publisher.publish(&request()).await.unwrap_err();

    assert!(matches!(err, PublishError::InvalidResponse(_)));
}
