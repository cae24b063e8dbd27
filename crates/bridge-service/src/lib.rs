//! Meeting Bridge Service Library
//!
//! Receives Tencent Meeting (WeMeet) webhook callbacks and mirrors meeting
//! lifecycle events into DingTalk as to-dos, calendar events and recording
//! notification cards.
//!
//! # Architecture
//!
//! The bridge follows the Handler -> Service -> Repository pattern:
//!
//! ```text
//! routes/mod.rs -> handlers/*.rs -> services/*.rs -> repositories/*.rs
//! ```
//!
//! A webhook request passes admission, signature verification, payload
//! decoding and parsing, is acknowledged, and is then routed on the
//! background dispatcher.
//!
//! # Modules
//!
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP request handlers
//! - `middleware` - HTTP metrics middleware
//! - `models` - Event, meeting and record models
//! - `observability` - Prometheus metrics
//! - `repositories` - Idempotency store and identity cache
//! - `routes` - Axum router setup
//! - `services` - Webhook pipeline, event router, platform clients

pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod repositories;
pub mod routes;
pub mod services;
