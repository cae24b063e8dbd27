//! HTTP routes for the meeting bridge.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::errors::BridgeError;
use crate::handlers;
use crate::middleware::http_metrics_middleware;
use crate::repositories::{SideEffectStore, UserIdentityStore};
use crate::services::{
    CachingIdentityResolver, Dispatcher, EventRouter, EventRouterDeps, MeetingDirectory, Notifier,
    PayloadCodec, RateLimiter, SideEffectSwitches, SignatureVerifier,
};
use axum::{middleware, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Webhook admission token bucket.
    pub admission: Arc<RateLimiter>,

    /// Webhook signature verifier.
    pub verifier: Arc<SignatureVerifier>,

    /// Webhook payload decoder.
    pub codec: Arc<PayloadCodec>,

    /// Background task dispatcher for accepted events.
    pub dispatcher: Arc<Dispatcher>,

    /// Event router run by dispatched tasks.
    pub events: Arc<EventRouter>,

    /// Idempotency store, pinged by the readiness probe.
    pub side_effects: Arc<dyn SideEffectStore>,

    /// Set once shutdown starts; readiness reports 503 from then on.
    pub shutting_down: Arc<AtomicBool>,
}

/// Remote services and stores the bridge is wired to.
pub struct Collaborators {
    pub directory: Arc<dyn MeetingDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub side_effects: Arc<dyn SideEffectStore>,
    pub identities: Arc<dyn UserIdentityStore>,
}

impl AppState {
    /// Assemble the webhook pipeline from configuration and collaborators.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Internal` if the webhook AES key is invalid.
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<Self, BridgeError> {
        let codec = PayloadCodec::new(config.webhook_aes_key.as_ref())
            .map_err(|e| BridgeError::Internal(format!("Invalid webhook AES key: {e}")))?;

        let identities = Arc::new(CachingIdentityResolver::new(
            collaborators.identities,
            collaborators.notifier.clone(),
        ));

        let events = EventRouter::new(
            EventRouterDeps {
                directory: collaborators.directory,
                notifier: collaborators.notifier,
                identities,
                store: collaborators.side_effects.clone(),
            },
            SideEffectSwitches {
                todo: config.todo_enabled,
                calendar: config.calendar_enabled,
            },
        );

        Ok(Self {
            admission: Arc::new(RateLimiter::new(
                config.webhook_rate_limit,
                config.webhook_burst_capacity,
            )),
            verifier: Arc::new(SignatureVerifier::new(config.webhook_token.clone())),
            codec: Arc::new(codec),
            dispatcher: Arc::new(Dispatcher::new(
                config.webhook_max_concurrent,
                config.webhook_max_queue_length,
            )),
            events: Arc::new(events),
            side_effects: collaborators.side_effects,
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/health` - Liveness probe (simple "OK")
/// - `/ready` - Readiness probe (pings the idempotency store)
/// - `/metrics` - Prometheus metrics endpoint
/// - `/api/webhook` - WeMeet URL verification (GET) and event callback (POST)
/// - `/api/v1/webhook/status` - Admission and dispatcher status
/// - TraceLayer for request logging
/// - HTTP metrics middleware
/// - 30 second request timeout
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route(
            "/api/webhook",
            get(handlers::verify_url).post(handlers::receive_event),
        )
        .route("/api/v1/webhook/status", get(handlers::webhook_status))
        .with_state(state);

    // Metrics route with its own state
    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    // 3. http_metrics_middleware - Record ALL responses (outermost)
    public_routes
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(middleware::from_fn(http_metrics_middleware))
}
