//! Observability for the meeting bridge.
//!
//! Prometheus metric definitions and recording helpers.

pub mod metrics;
