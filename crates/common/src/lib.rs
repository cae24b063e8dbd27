//! Utilities shared across meeting bridge components.

#![warn(clippy::pedantic)]

/// Secret types that prevent accidental logging
pub mod secret;

/// DingTalk app access-token acquisition with automatic refresh
pub mod token_manager;
