//! Metrics definitions for the meeting bridge.
//!
//! All metrics follow Prometheus naming conventions:
//! - `bridge_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `endpoint`: known paths, everything else is `/other`
//! - `event_kind`: the five handled kinds plus `unknown`
//! - `service`: `wemeet` or `dingtalk`
//! - `operation`: bounded by code
//! - `status` / `outcome`: small fixed sets

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Webhook acknowledgements should stay well under the sender's timeout
        .set_buckets_for_metric(
            Matcher::Prefix("bridge_http_request".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.150, 0.200, 0.300, 0.500, 1.000, 2.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        // Background tasks include several remote calls each
        .set_buckets_for_metric(
            Matcher::Prefix("bridge_task".to_string()),
            &[
                0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000, 30.000,
            ],
        )
        .map_err(|e| format!("Failed to set task buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("bridge_downstream_request".to_string()),
            &[
                0.010, 0.025, 0.050, 0.100, 0.200, 0.500, 1.000, 2.000, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set downstream request buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("bridge_db_query".to_string()),
            &[
                0.001, 0.002, 0.005, 0.010, 0.020, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set DB query buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// HTTP Request Metrics
// ============================================================================

/// Record HTTP request completion
///
/// Metric: `bridge_http_requests_total`, `bridge_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let normalized_endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("bridge_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("bridge_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

/// Categorize HTTP status code into success/error/timeout
fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Normalize endpoint path to prevent label cardinality explosion
fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/" => "/",
        "/health" => "/health",
        "/ready" => "/ready",
        "/metrics" => "/metrics",
        "/api/webhook" => "/api/webhook",
        "/api/v1/webhook/status" => "/api/v1/webhook/status",
        _ => "/other",
    }
}

// ============================================================================
// Webhook Pipeline Metrics
// ============================================================================

/// Record an admission decision.
///
/// Metric: `bridge_webhook_admissions_total`
/// Labels: `outcome` (accepted, limited)
pub fn record_admission(accepted: bool) {
    let outcome = if accepted { "accepted" } else { "limited" };
    counter!("bridge_webhook_admissions_total", "outcome" => outcome).increment(1);
}

/// Record where a webhook request ended up.
///
/// Metric: `bridge_webhook_requests_total`
/// Labels: `kind` (verification, event), `outcome`
pub fn record_webhook(kind: &'static str, outcome: &'static str) {
    counter!("bridge_webhook_requests_total",
        "kind" => kind,
        "outcome" => outcome
    )
    .increment(1);
}

// ============================================================================
// Dispatcher Metrics
// ============================================================================

/// Update queue depth and running-task gauges.
///
/// Metric: `bridge_task_queue_length`, `bridge_tasks_running`
pub fn set_dispatcher_load(queue_length: usize, running: usize) {
    #[allow(clippy::cast_precision_loss)]
    {
        gauge!("bridge_task_queue_length").set(queue_length as f64);
        gauge!("bridge_tasks_running").set(running as f64);
    }
}

/// Record a finished background task.
///
/// Metric: `bridge_tasks_total`, `bridge_task_duration_seconds`,
/// `bridge_task_wait_seconds`
/// Labels: `event_kind`, `status` (success, error, panic)
pub fn record_task(event_kind: &str, status: &'static str, waited: Duration, duration: Duration) {
    histogram!("bridge_task_wait_seconds", "event_kind" => event_kind.to_string())
        .record(waited.as_secs_f64());

    histogram!("bridge_task_duration_seconds",
        "event_kind" => event_kind.to_string(),
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("bridge_tasks_total",
        "event_kind" => event_kind.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a task rejected because the backlog limit was reached.
///
/// Metric: `bridge_tasks_rejected_total`
pub fn record_task_rejected(event_kind: &str) {
    counter!("bridge_tasks_rejected_total", "event_kind" => event_kind.to_string()).increment(1);
}

// ============================================================================
// Event Handling Metrics
// ============================================================================

/// Record what a handler did with a side effect.
///
/// Metric: `bridge_side_effects_total`
/// Labels: `effect` (todo, calendar, card), `action`, `outcome`
pub fn record_side_effect(effect: &'static str, action: &'static str, outcome: &'static str) {
    counter!("bridge_side_effects_total",
        "effect" => effect,
        "action" => action,
        "outcome" => outcome
    )
    .increment(1);
}

// ============================================================================
// Downstream and Storage Metrics
// ============================================================================

/// Record a call to WeMeet or DingTalk.
///
/// Metric: `bridge_downstream_requests_total`, `bridge_downstream_request_duration_seconds`
/// Labels: `service`, `operation`, `status`
pub fn record_downstream_request(
    service: &'static str,
    operation: &'static str,
    status: &'static str,
    duration: Duration,
) {
    histogram!("bridge_downstream_request_duration_seconds",
        "service" => service,
        "operation" => operation,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("bridge_downstream_requests_total",
        "service" => service,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

/// Record a store query.
///
/// Metric: `bridge_db_queries_total`, `bridge_db_query_duration_seconds`
/// Labels: `operation`, `status`
pub fn record_db_query(operation: &'static str, status: &'static str, duration: Duration) {
    histogram!("bridge_db_query_duration_seconds",
        "operation" => operation,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("bridge_db_queries_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests exercise the recording functions without a recorder
    // installed; the metrics facade turns them into no-ops.

    #[test]
    fn test_record_http_request() {
        record_http_request("POST", "/api/webhook", 200, Duration::from_millis(5));
        record_http_request("GET", "/api/webhook", 403, Duration::from_millis(1));
        record_http_request("GET", "/unknown/path", 404, Duration::from_millis(1));
        record_http_request("POST", "/api/webhook", 504, Duration::from_secs(30));
    }

    #[test]
    fn test_categorize_status_code() {
        assert_eq!(categorize_status_code(200), "success");
        assert_eq!(categorize_status_code(204), "success");
        assert_eq!(categorize_status_code(408), "timeout");
        assert_eq!(categorize_status_code(504), "timeout");
        assert_eq!(categorize_status_code(400), "error");
        assert_eq!(categorize_status_code(403), "error");
        assert_eq!(categorize_status_code(429), "error");
        assert_eq!(categorize_status_code(500), "error");
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("/health"), "/health");
        assert_eq!(normalize_endpoint("/ready"), "/ready");
        assert_eq!(normalize_endpoint("/metrics"), "/metrics");
        assert_eq!(normalize_endpoint("/api/webhook"), "/api/webhook");
        assert_eq!(
            normalize_endpoint("/api/v1/webhook/status"),
            "/api/v1/webhook/status"
        );
        assert_eq!(normalize_endpoint("/api/webhook/extra"), "/other");
        assert_eq!(normalize_endpoint("/wp-admin"), "/other");
    }

    #[test]
    fn test_pipeline_metrics() {
        record_admission(true);
        record_admission(false);
        record_webhook("event", "accepted");
        record_webhook("verification", "invalid_signature");
        set_dispatcher_load(3, 5);
        record_task(
            "meeting.created",
            "success",
            Duration::from_millis(2),
            Duration::from_millis(120),
        );
        record_task_rejected("meeting.updated");
        record_side_effect("todo", "create", "success");
    }

    #[test]
    fn test_downstream_and_db_metrics() {
        record_downstream_request("dingtalk", "create_todo", "success", Duration::from_millis(80));
        record_downstream_request("wemeet", "meeting_detail", "error", Duration::from_millis(300));
        record_db_query("find_side_effect", "success", Duration::from_millis(2));
        record_db_query("insert_side_effect", "error", Duration::from_millis(9));
    }

    #[test]
    fn test_pipeline_metric_names() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        ::metrics::with_local_recorder(&recorder, || {
            record_admission(true);
            record_webhook("event", "accepted");
            set_dispatcher_load(1, 2);
            record_side_effect("calendar", "delete", "not_found");
            record_downstream_request("dingtalk", "send_card", "error", Duration::from_millis(4));
        });

        let names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "bridge_webhook_admissions_total",
            "bridge_webhook_requests_total",
            "bridge_task_queue_length",
            "bridge_side_effects_total",
            "bridge_downstream_requests_total",
        ] {
            assert!(
                names.iter().any(|name| name == expected),
                "missing {expected} in {names:?}"
            );
        }
    }
}
