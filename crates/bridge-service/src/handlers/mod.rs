//! HTTP request handlers for the meeting bridge.

pub mod health;
pub mod metrics;
pub mod status;
pub mod webhook;

pub use health::{health_check, readiness_check};
pub use metrics::metrics_handler;
pub use status::webhook_status;
pub use webhook::{receive_event, verify_url};
