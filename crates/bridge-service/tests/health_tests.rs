//! Health, readiness, metrics and status endpoint integration tests.
//!
//! Note: `/health` returns plain text "OK" for liveness probes.
//! `/ready` returns JSON describing the idempotency store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bridge_service::errors::BridgeError;
use bridge_service::models::{SideEffectKind, SideEffectRecord};
use bridge_service::repositories::SideEffectStore;
use bridge_test_utils::TestBridgeServer;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Store whose backend is unreachable.
struct UnreachableStore;

#[async_trait::async_trait]
impl SideEffectStore for UnreachableStore {
    async fn find(
        &self,
        _meeting_id: &str,
        _kind: SideEffectKind,
    ) -> Result<Option<SideEffectRecord>, BridgeError> {
        Err(BridgeError::Database("connection refused".to_string()))
    }

    async fn insert(&self, _record: &SideEffectRecord) -> Result<bool, BridgeError> {
        Err(BridgeError::Database("connection refused".to_string()))
    }

    async fn delete(&self, _meeting_id: &str, _kind: SideEffectKind) -> Result<bool, BridgeError> {
        Err(BridgeError::Database("connection refused".to_string()))
    }

    async fn ping(&self) -> Result<(), BridgeError> {
        Err(BridgeError::Database("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_health_endpoint_returns_200() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::spawn().await?;

    let response = reqwest::get(format!("{}/health", server.url())).await?;

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await?, "OK");

    Ok(())
}

#[tokio::test]
async fn test_ready_endpoint_reports_store() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::spawn().await?;

    let response = reqwest::get(format!("{}/ready", server.url())).await?;

    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok());
    assert!(
        content_type.is_some_and(|ct| ct.contains("application/json")),
        "Expected application/json content type, got {:?}",
        content_type
    );

    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["store"], "healthy");

    Ok(())
}

#[tokio::test]
async fn test_ready_endpoint_returns_503_when_store_unreachable() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::builder()
        .side_effects(Arc::new(UnreachableStore))
        .spawn()
        .await?;

    let response = reqwest::get(format!("{}/ready", server.url())).await?;

    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["status"], "not_ready");
    assert_eq!(body["store"], "unhealthy");
    // The underlying cause stays in the logs
    assert!(!body.to_string().contains("connection refused"));

    Ok(())
}

#[tokio::test]
async fn test_ready_endpoint_returns_503_while_shutting_down() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::spawn().await?;
    server.state().shutting_down.store(true, Ordering::SeqCst);

    let response = reqwest::get(format!("{}/ready", server.url())).await?;

    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["status"], "shutting_down");

    // Liveness is unaffected
    let response = reqwest::get(format!("{}/health", server.url())).await?;
    assert_eq!(response.status(), 200);

    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_returns_200() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::spawn().await?;

    let response = reqwest::get(format!("{}/metrics", server.url())).await?;

    assert_eq!(response.status(), 200);

    Ok(())
}

#[tokio::test]
async fn test_webhook_status_reports_pipeline() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::builder()
        .var("WEBHOOK_RATE_LIMIT", "7")
        .var("WEBHOOK_BURST_CAPACITY", "21")
        .var("WEBHOOK_MAX_CONCURRENT", "4")
        .var("WEBHOOK_MAX_QUEUE_LENGTH", "0")
        .spawn()
        .await?;

    let response = reqwest::get(format!("{}/api/v1/webhook/status", server.url())).await?;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await?;

    assert_eq!(body["admission"]["rate"], 7);
    assert_eq!(body["admission"]["capacity"], 21);
    assert_eq!(body["admission"]["limited_requests"], 0);
    assert_eq!(body["dispatcher"]["max_concurrent"], 4);
    assert_eq!(body["dispatcher"]["max_queue_length"], 0);
    assert_eq!(body["dispatcher"]["queue_length"], 0);
    assert_eq!(body["dispatcher"]["running_tasks"], 0);

    Ok(())
}

#[tokio::test]
async fn test_unknown_route_is_404() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::spawn().await?;

    let response = reqwest::get(format!("{}/api/unknown", server.url())).await?;

    assert_eq!(response.status(), 404);

    Ok(())
}
