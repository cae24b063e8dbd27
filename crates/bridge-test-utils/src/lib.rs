//! # Bridge Test Utilities
//!
//! Shared test utilities for the meeting bridge.
//!
//! This crate provides:
//! - Server test harness (`TestBridgeServer` for E2E tests)
//! - Signed webhook request builders and event fixtures
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bridge_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<()> {
//!     let server = TestBridgeServer::spawn().await?;
//!     let webhook = server.webhook_client();
//!
//!     let response = webhook.post_event(&fixtures::meeting_created("m-1", "alice")).await?;
//!
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod server_harness;
pub mod webhook_client;

// Re-export commonly used items
pub use server_harness::*;
pub use webhook_client::*;
