//! Tests for the upload transport module

use super::*;
use crate::config::HostConfig;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport_for(server: &MockServer) -> HttpTransport {
    let config = HttpTransportConfig::builder()
        .base_url(server.uri())
        .upload_target_id("ds-1")
        .auth_token("secret-token")
        .build();
    HttpTransport::new(config).unwrap()
}

#[test]
fn test_transport_config_default() {
    let config = HttpTransportConfig::default();
    assert!(config.auth_token.is_none());
    assert!(config.rate_limit.is_none());
    assert!(config.user_agent.starts_with("recsync/"));
}

#[test]
fn test_transport_config_from_host_config() {
    let host = HostConfig::builder()
        .record_type("glucose")
        .upload_target_id("ds-7")
        .base_url("https://upload.example.com")
        .auth_token("tok")
        .requests_per_second(4)
        .build()
        .unwrap();

    let config = HttpTransportConfig::from_host_config(&host).unwrap();
    assert_eq!(config.upload_target_id, "ds-7");
    assert_eq!(config.auth_token.as_deref(), Some("tok"));
    assert_eq!(config.rate_limit, Some(RateLimiterConfig::new(4, 4)));

    let transport = HttpTransport::new(config).unwrap();
    assert_eq!(
        transport.endpoint().as_str(),
        "https://upload.example.com/v1/datasets/ds-7/data"
    );
}

#[test]
fn test_transport_requires_target() {
    let host = HostConfig::builder().record_type("glucose").build().unwrap();
    assert!(HttpTransport::from_host_config(&host).is_err());
}

#[tokio::test]
async fn test_create_batch_posts_json() {
    let server = MockServer::start().await;
    let body = json!([{"id": "r1", "type": "glucose"}]);

    Mock::given(method("POST"))
        .and(path("/v1/datasets/ds-1/data"))
        .and(header("authorization", "Bearer secret-token"))
        .and(body_json(body.clone()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport_for(&server)
        .create_batch(&body, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_delete_batch_uses_delete() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/datasets/ds-1/data"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport_for(&server)
        .delete_batch(&json!([{"origin": {"id": "r1"}}]), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(response.status, 204);
}

#[tokio::test]
async fn test_error_status_is_returned_not_raised() {
    let server = MockServer::start().await;
    let details = json!({"errors": [{"source": {"pointer": "/3"}}]});

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(details.clone()))
        .mount(&server)
        .await;

    let response = transport_for(&server)
        .create_batch(&json!([]), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(response.status, 400);
    assert!(!response.is_success());
    let parsed: serde_json::Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(parsed, details);
}

#[tokio::test]
async fn test_timeout_maps_to_timeout_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let err = transport_for(&server)
        .create_batch(&json!([]), Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, crate::Error::Timeout { timeout_ms: 100 }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_connection_refused_is_retryable() {
    let config = HttpTransportConfig::builder()
        .base_url("http://127.0.0.1:1")
        .upload_target_id("ds-1")
        .build();
    let transport = HttpTransport::new(config).unwrap();

    let err = transport
        .create_batch(&json!([]), Duration::from_secs(2))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
}
