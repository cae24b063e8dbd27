//! Service layer for the meeting bridge.
//!
//! The webhook pipeline (admission, signature, payload, dispatcher), the
//! event router with its handlers, and clients for the two platforms.

pub mod admission;
pub mod dingtalk_client;
pub mod dispatcher;
pub mod event_router;
pub mod formatting;
pub mod identity;
pub mod meeting_locks;
pub mod payload;
pub mod recurrence;
pub mod signature;
pub mod wemeet_client;

pub use admission::RateLimiter;
pub use dingtalk_client::{DingtalkClient, DingtalkSettings, Notifier};
pub use dispatcher::Dispatcher;
pub use event_router::{EventRouter, EventRouterDeps, SideEffectSwitches};
pub use identity::{CachingIdentityResolver, IdentityResolver};
pub use payload::PayloadCodec;
pub use signature::SignatureVerifier;
pub use wemeet_client::{MeetingDirectory, WemeetClient, WemeetCredentials};
