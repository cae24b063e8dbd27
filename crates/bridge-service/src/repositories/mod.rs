//! Repository layer for the meeting bridge.
//!
//! Handler -> Service -> Repository. Each store is a trait with a sqlx
//! PostgreSQL implementation and an in-memory one.

pub mod side_effects;
pub mod user_identities;

pub use side_effects::{InMemorySideEffectStore, PgSideEffectStore, SideEffectStore};
pub use user_identities::{InMemoryUserIdentityStore, PgUserIdentityStore, UserIdentityStore};
