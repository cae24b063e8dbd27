//! HTTP middleware for the meeting bridge.

pub mod http_metrics;

pub use http_metrics::http_metrics_middleware;
