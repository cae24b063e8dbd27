//! Secret wrappers for credentials the bridge holds.
//!
//! Re-exports [`secrecy`] types. `SecretString` and `SecretBox<T>` print as
//! `[REDACTED]` under `Debug`, so structs that derive `Debug` stay safe to log,
//! and the inner value is zeroized on drop.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct AppCredentials {
//!     app_key: String,
//!     app_secret: SecretString,
//! }
//!
//! let creds = AppCredentials {
//!     app_key: "ding-app".to_string(),
//!     app_secret: SecretString::from("s3cr3t"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("s3cr3t"));
//! assert_eq!(creds.app_secret.expose_secret(), "s3cr3t");
//! ```
//!
//! Wrap with `SecretString`: the webhook token, the webhook AES key, the
//! WeMeet secret key, the DingTalk app secret, and issued access tokens.
//! Wrap decoded binary keys with `SecretBox<[u8; N]>`.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
