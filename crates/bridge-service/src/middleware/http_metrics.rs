//! HTTP metrics middleware.
//!
//! Sits outermost so framework-level rejections (404, 405, 415, body
//! extraction failures, timeouts) are counted alongside handler responses.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::observability::metrics::record_http_request;

/// Record method, normalized path, status and latency for every response.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_http_request(&method, &path, response.status().as_u16(), start.elapsed());

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    async fn accepted() -> &'static str {
        "successfully received callback"
    }

    async fn limited() -> (StatusCode, &'static str) {
        (StatusCode::TOO_MANY_REQUESTS, "slow down")
    }

    fn test_app() -> Router {
        Router::new()
            .route("/api/webhook", post(accepted))
            .route("/limited", get(limited))
            .layer(middleware::from_fn(http_metrics_middleware))
    }

    async fn status_for(method: &str, uri: &str) -> StatusCode {
        let request = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request builder should succeed");

        test_app()
            .oneshot(request)
            .await
            .expect("request should succeed")
            .status()
    }

    #[tokio::test]
    async fn test_middleware_passes_success_through() {
        assert_eq!(status_for("POST", "/api/webhook").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_middleware_passes_error_through() {
        assert_eq!(status_for("GET", "/limited").await, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_middleware_sees_framework_rejections() {
        assert_eq!(status_for("GET", "/nonexistent").await, StatusCode::NOT_FOUND);
        assert_eq!(
            status_for("DELETE", "/api/webhook").await,
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
