//! DingTalk application access-token manager.
//!
//! Acquires an app access token with the app key and secret and keeps it
//! fresh in the background.
//!
//! - Refreshes before expiry (configurable threshold)
//! - Exponential backoff on failure (1s, 2s, 4s, ..., max 30s)
//! - Readers go through a `tokio::sync::watch` channel and never block the refresher
//! - Retries forever; the caller bounds startup with its own timeout
//!
//! ```rust,ignore
//! use common::token_manager::{spawn_token_manager, TokenManagerConfig};
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let config = TokenManagerConfig::new(
//!     "https://api.dingtalk.com".to_string(),
//!     "ding-app-key".to_string(),
//!     SecretString::from("secret"),
//! );
//!
//! let (task_handle, token_rx) = spawn_token_manager(config).await?;
//! let token = token_rx.token();
//! // x-acs-dingtalk-access-token: token.expose_secret()
//! task_handle.abort();
//! ```

use crate::secret::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

/// Refresh this long before the token expires.
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(300);

/// Default HTTP request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Path of the app access-token endpoint.
pub const ACCESS_TOKEN_PATH: &str = "/v1.0/oauth2/accessToken";

const INITIAL_BACKOFF_MS: u64 = 1000;

const MAX_BACKOFF_MS: u64 = 30_000;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra margin subtracted from the expiry for clock skew against DingTalk.
const CLOCK_DRIFT_MARGIN_SECS: i64 = 30;

/// Errors that can occur during token management.
#[derive(Error, Debug, Clone)]
pub enum TokenError {
    #[error("Token acquisition failed: {0}")]
    AcquisitionFailed(String),

    #[error("HTTP client error: {0}")]
    HttpError(String),

    /// Credentials rejected by DingTalk (400, 401, 403).
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Token channel closed")]
    ChannelClosed,
}

/// Configuration for the token manager.
#[derive(Clone)]
pub struct TokenManagerConfig {
    /// DingTalk API base URL (e.g., `https://api.dingtalk.com`).
    pub api_url: String,

    /// Application key (client id).
    pub app_key: String,

    pub app_secret: SecretString,

    pub refresh_threshold: Duration,

    pub http_timeout: Duration,
}

impl std::fmt::Debug for TokenManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManagerConfig")
            .field("api_url", &self.api_url)
            .field("app_key", &self.app_key)
            .field("app_secret", &"[REDACTED]")
            .field("refresh_threshold", &self.refresh_threshold)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl TokenManagerConfig {
    /// Create a new configuration with default timeouts.
    #[must_use]
    pub fn new(api_url: String, app_key: String, app_secret: SecretString) -> Self {
        Self {
            api_url,
            app_key,
            app_secret,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}

/// Cheap, cloneable handle to the current token.
///
/// `token()` clones out of the channel so callers never hold the borrow
/// across an await.
#[derive(Clone)]
pub struct TokenReceiver(watch::Receiver<SecretString>);

impl TokenReceiver {
    /// Get the current token.
    ///
    /// Non-empty once `spawn_token_manager` has returned.
    #[must_use]
    pub fn token(&self) -> SecretString {
        self.0.borrow().clone()
    }

    /// Wait for the token to change.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::ChannelClosed` if the sender is dropped.
    pub async fn changed(&mut self) -> Result<(), TokenError> {
        self.0
            .changed()
            .await
            .map_err(|_| TokenError::ChannelClosed)
    }

    /// Wrap a watch channel directly, skipping acquisition.
    ///
    /// ```rust,ignore
    /// let (_tx, rx) = tokio::sync::watch::channel(SecretString::from("test-token"));
    /// let receiver = TokenReceiver::from_test_channel(rx);
    /// ```
    #[cfg(any(test, feature = "test-utils"))]
    #[must_use]
    pub fn from_test_channel(rx: watch::Receiver<SecretString>) -> Self {
        Self(rx)
    }
}

impl std::fmt::Debug for TokenReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenReceiver")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenRequest<'a> {
    app_key: &'a str,
    app_secret: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenResponse {
    access_token: String,
    /// Lifetime in seconds.
    expire_in: u64,
}

impl std::fmt::Debug for AccessTokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("expire_in", &self.expire_in)
            .finish()
    }
}

/// Spawn the token manager background task.
///
/// Returns once the first token has been acquired. The returned receiver
/// always holds a non-empty token. Abort the handle to stop refreshing.
///
/// # Errors
///
/// - `TokenError::Configuration` - If the HTTP client cannot be built
/// - `TokenError::ChannelClosed` - If the refresh task exits before the first token
#[instrument(skip_all, fields(app_key = %config.app_key))]
pub async fn spawn_token_manager(
    config: TokenManagerConfig,
) -> Result<(JoinHandle<()>, TokenReceiver), TokenError> {
    let http_client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .build()
        .map_err(|e| TokenError::Configuration(format!("Failed to build HTTP client: {e}")))?;

    // Empty string is the "not yet acquired" sentinel
    let (sender, mut receiver) = watch::channel(SecretString::from(""));

    let task_handle = tokio::spawn(async move {
        token_refresh_loop(config, http_client, sender).await;
    });

    receiver
        .changed()
        .await
        .map_err(|_| TokenError::ChannelClosed)?;

    if receiver.borrow().expose_secret().is_empty() {
        return Err(TokenError::AcquisitionFailed(
            "Token is empty after acquisition".into(),
        ));
    }

    Ok((task_handle, TokenReceiver(receiver)))
}

#[instrument(skip_all)]
async fn token_refresh_loop(
    config: TokenManagerConfig,
    http_client: reqwest::Client,
    sender: watch::Sender<SecretString>,
) {
    let mut backoff = INITIAL_BACKOFF_MS;
    let mut expires_at: Option<i64> = None;
    let mut initial_acquisition = true;

    #[allow(clippy::cast_possible_wrap)]
    let threshold_secs = config.refresh_threshold.as_secs() as i64;

    loop {
        let needs_refresh = match expires_at {
            Some(exp) => {
                let now = chrono::Utc::now().timestamp();
                exp - now <= threshold_secs + CLOCK_DRIFT_MARGIN_SECS
            }
            None => true,
        };

        if needs_refresh {
            match acquire_token(&config, &http_client).await {
                Ok((token, new_expires_at)) => {
                    expires_at = Some(new_expires_at);

                    if sender.send(token).is_err() {
                        debug!(
                            target: "common.token_manager",
                            app_key = %config.app_key,
                            "All receivers dropped, stopping refresh loop"
                        );
                        break;
                    }

                    if initial_acquisition {
                        info!(
                            target: "common.token_manager",
                            app_key = %config.app_key,
                            "Initial access token acquired"
                        );
                        initial_acquisition = false;
                    } else {
                        debug!(
                            target: "common.token_manager",
                            app_key = %config.app_key,
                            "Access token refreshed"
                        );
                    }

                    backoff = INITIAL_BACKOFF_MS;
                }
                Err(e) => {
                    warn!(
                        target: "common.token_manager",
                        app_key = %config.app_key,
                        error = %e,
                        backoff_ms = backoff,
                        "Access token acquisition failed, will retry"
                    );

                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_MS);
                    continue;
                }
            }
        }

        let sleep_duration = match expires_at {
            Some(exp) => {
                let now = chrono::Utc::now().timestamp();
                let refresh_at = exp - threshold_secs - CLOCK_DRIFT_MARGIN_SECS;
                let sleep_secs = (refresh_at - now).max(1);
                #[allow(clippy::cast_sign_loss)]
                Duration::from_secs(sleep_secs as u64)
            }
            None => Duration::from_secs(1),
        };

        tokio::time::sleep(sleep_duration).await;
    }
}

/// Request a new app access token.
///
/// Returns the token and its expiry as a Unix timestamp.
#[instrument(skip_all)]
async fn acquire_token(
    config: &TokenManagerConfig,
    http_client: &reqwest::Client,
) -> Result<(SecretString, i64), TokenError> {
    let url = format!("{}{ACCESS_TOKEN_PATH}", config.api_url);

    debug!(
        target: "common.token_manager",
        app_key = %config.app_key,
        url = %url,
        "Requesting access token"
    );

    let body = AccessTokenRequest {
        app_key: &config.app_key,
        app_secret: config.app_secret.expose_secret(),
    };

    let response = http_client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| {
            debug!(target: "common.token_manager", error = %e, "HTTP request failed");
            TokenError::HttpError(e.to_string())
        })?;

    let status = response.status();

    if status.is_success() {
        let token_response: AccessTokenResponse = response.json().await.map_err(|e| {
            warn!(target: "common.token_manager", error = %e, "Failed to parse token response");
            TokenError::InvalidResponse(e.to_string())
        })?;

        if token_response.access_token.is_empty() {
            return Err(TokenError::InvalidResponse("empty accessToken".into()));
        }

        let now = chrono::Utc::now().timestamp();
        #[allow(clippy::cast_possible_wrap)]
        let expires_at = now + token_response.expire_in as i64;

        debug!(
            target: "common.token_manager",
            expires_in_secs = token_response.expire_in,
            "Access token acquired"
        );

        Ok((SecretString::from(token_response.access_token), expires_at))
    } else if matches!(status.as_u16(), 400 | 401 | 403) {
        let body = response.text().await.unwrap_or_else(|e| {
            trace!(target: "common.token_manager", error = %e, "Failed to read error response body");
            "<failed to read body>".to_string()
        });
        warn!(
            target: "common.token_manager",
            status = %status,
            "Credentials rejected by DingTalk"
        );
        trace!(
            target: "common.token_manager",
            body = %body,
            "Rejection response body"
        );
        Err(TokenError::AuthenticationRejected(format!(
            "Status {status}"
        )))
    } else if status.is_server_error() {
        warn!(
            target: "common.token_manager",
            status = %status,
            "DingTalk returned server error"
        );
        Err(TokenError::HttpError(format!("Server error: {status}")))
    } else {
        warn!(
            target: "common.token_manager",
            status = %status,
            "Unexpected response from DingTalk"
        );
        Err(TokenError::HttpError(format!(
            "Unexpected status: {status}"
        )))
    }
}
