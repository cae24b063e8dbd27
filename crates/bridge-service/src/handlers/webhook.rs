//! WeMeet webhook handlers.
//!
//! - `GET /api/webhook`: URL verification handshake. The decoded `check_str`
//!   is echoed back as the raw body.
//! - `POST /api/webhook`: event callback. The event is acknowledged as soon
//!   as it is admitted, authenticated, decoded and parsed as JSON; the
//!   event itself is interpreted on the dispatcher.
//!
//! Signatures are checked before anything is decoded.

use crate::errors::BridgeError;
use crate::models::EventKind;
use crate::observability::metrics;
use crate::routes::AppState;
use crate::services::dispatcher::{TaskContext, TaskError};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Body returned for every accepted event.
pub const ACK_BODY: &str = "successfully received callback";

#[derive(Debug, Deserialize)]
pub struct VerificationQuery {
    #[serde(default)]
    pub check_str: String,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(default)]
    data: String,
}

/// The `timestamp`, `nonce` and `signature` headers every callback carries.
#[derive(Debug)]
struct SignatureHeaders<'a> {
    timestamp: &'a str,
    nonce: &'a str,
    signature: &'a str,
}

fn signature_headers(headers: &HeaderMap) -> Result<SignatureHeaders<'_>, BridgeError> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
    };

    match (get("timestamp"), get("nonce"), get("signature")) {
        (Some(timestamp), Some(nonce), Some(signature)) => Ok(SignatureHeaders {
            timestamp,
            nonce,
            signature,
        }),
        _ => Err(BridgeError::BadRequest(
            "Missing required headers".to_string(),
        )),
    }
}

fn authenticate(
    state: &AppState,
    kind: &'static str,
    headers: &SignatureHeaders<'_>,
    data: &str,
) -> Result<(), BridgeError> {
    if state
        .verifier
        .verify(headers.timestamp, headers.nonce, data, headers.signature)
    {
        return Ok(());
    }

    warn!(target: "bridge.webhook", kind, "Signature verification failed");
    metrics::record_webhook(kind, "invalid_signature");
    Err(BridgeError::InvalidSignature)
}

/// Handler for GET /api/webhook
///
/// Returns the decoded `check_str` as plain text (no quoting, no newline).
///
/// # Errors
///
/// - 400 if a signature header is missing
/// - 403 if the signature does not match
/// - 500 if `check_str` cannot be decoded
#[instrument(skip_all, name = "bridge.webhook.verify")]
pub async fn verify_url(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<VerificationQuery>,
) -> Result<String, BridgeError> {
    let signed = signature_headers(&headers).inspect_err(|_| {
        metrics::record_webhook("verification", "bad_request");
    })?;

    authenticate(&state, "verification", &signed, &query.check_str)?;

    let plaintext = state.codec.decode(&query.check_str).map_err(|e| {
        metrics::record_webhook("verification", "decode_failed");
        BridgeError::from(e)
    })?;

    metrics::record_webhook("verification", "accepted");
    debug!(target: "bridge.webhook", "URL verification succeeded");
    Ok(plaintext)
}

/// Handler for POST /api/webhook
///
/// # Errors
///
/// - 429 if admission is denied
/// - 400 if a signature header is missing or the body is not a JSON envelope
/// - 403 if the signature does not match
/// - 500 if the payload cannot be decoded or is not JSON
/// - 503 if the dispatcher backlog is full
#[instrument(skip_all, name = "bridge.webhook.event")]
pub async fn receive_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, BridgeError> {
    if !state.admission.try_acquire(1) {
        warn!(target: "bridge.webhook", "Request throttled");
        metrics::record_webhook("event", "limited");
        return Err(BridgeError::RateLimitExceeded);
    }

    let signed = signature_headers(&headers).inspect_err(|_| {
        metrics::record_webhook("event", "bad_request");
    })?;

    let envelope: EventEnvelope = serde_json::from_slice(&body).map_err(|e| {
        metrics::record_webhook("event", "bad_request");
        BridgeError::BadRequest(format!("Invalid request body: {e}"))
    })?;

    authenticate(&state, "event", &signed, &envelope.data)?;

    let plaintext = state.codec.decode(&envelope.data).map_err(|e| {
        metrics::record_webhook("event", "decode_failed");
        BridgeError::from(e)
    })?;

    // Only the JSON syntax is checked here; the event shape is checked by
    // the routed task, after the acknowledgment
    let event: Value = serde_json::from_str(&plaintext).map_err(|e| {
        metrics::record_webhook("event", "invalid_payload");
        BridgeError::InvalidPayload(e.to_string())
    })?;

    let kind = EventKind::parse(event.get("event").and_then(Value::as_str).unwrap_or_default());
    let context = TaskContext {
        event_kind: kind.as_str().to_string(),
        timestamp: signed.timestamp.to_string(),
    };
    debug!(
        target: "bridge.webhook",
        event = kind.as_str(),
        trace_id = event.get("trace_id").and_then(serde_json::Value::as_str).unwrap_or_default(),
        "Event accepted"
    );

    let events = state.events.clone();
    let submitted = state
        .dispatcher
        .add_task(context, async move { events.route_raw(event).await });

    match submitted {
        // The handle is not awaited; the dispatcher logs the outcome
        Ok(_handle) => {
            metrics::record_webhook("event", "accepted");
            Ok(ACK_BODY)
        }
        Err(TaskError::QueueFull(pending)) => {
            metrics::record_webhook("event", "queue_full");
            Err(BridgeError::QueueFull(pending))
        }
        Err(e) => Err(BridgeError::Internal(e.to_string())),
    }
}
