//! Webhook pipeline status endpoint.

use crate::models::WebhookStatusResponse;
use crate::routes::AppState;
use axum::extract::State;
use axum::Json;
use std::sync::Arc;

/// Handler for GET /api/v1/webhook/status
///
/// Reports the admission bucket and the dispatcher queue.
pub async fn webhook_status(State(state): State<Arc<AppState>>) -> Json<WebhookStatusResponse> {
    Json(WebhookStatusResponse {
        admission: state.admission.status(),
        dispatcher: state.dispatcher.status(),
    })
}
