//! Signed webhook requests against a running bridge.

use bridge_service::services::payload::PayloadCodec;
use bridge_service::services::signature::compute_signature;
use common::secret::SecretString;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sends webhook callbacks the way WeMeet does: payload encoded with the
/// server's key, `timestamp`, `nonce` and `signature` headers attached.
pub struct WebhookClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    codec: PayloadCodec,
    nonce: AtomicU64,
}

impl WebhookClient {
    pub fn new(base_url: String, token: &str, aes_key: Option<&SecretString>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.to_string(),
            codec: PayloadCodec::new(aes_key).expect("test AES key should be valid"),
            nonce: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/webhook", self.base_url)
    }

    /// Wire form of `plaintext` under the server's key.
    pub fn encode(&self, plaintext: &str) -> String {
        self.codec
            .encode(plaintext)
            .expect("encoding test payload should succeed")
    }

    /// Fresh `(timestamp, nonce, signature)` for `data`.
    pub fn sign(&self, data: &str) -> (String, String, String) {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst).to_string();
        let signature = compute_signature(&self.token, &timestamp, &nonce, data);
        (timestamp, nonce, signature)
    }

    /// POST an event, encoded and correctly signed.
    pub async fn post_event(&self, event: &Value) -> Result<reqwest::Response, anyhow::Error> {
        let data = self.encode(&event.to_string());
        let (timestamp, nonce, signature) = self.sign(&data);
        self.post_body(json!({ "data": data }).to_string(), &timestamp, &nonce, &signature)
            .await
    }

    /// POST an event with a caller-chosen signature.
    pub async fn post_event_with_signature(
        &self,
        event: &Value,
        signature: &str,
    ) -> Result<reqwest::Response, anyhow::Error> {
        let data = self.encode(&event.to_string());
        let (timestamp, nonce, _) = self.sign(&data);
        self.post_body(json!({ "data": data }).to_string(), &timestamp, &nonce, signature)
            .await
    }

    /// POST an envelope whose `data` is sent as given, correctly signed.
    pub async fn post_data(&self, data: &str) -> Result<reqwest::Response, anyhow::Error> {
        let (timestamp, nonce, signature) = self.sign(data);
        self.post_body(json!({ "data": data }).to_string(), &timestamp, &nonce, &signature)
            .await
    }

    /// POST a raw body with explicit signature headers.
    pub async fn post_body(
        &self,
        body: String,
        timestamp: &str,
        nonce: &str,
        signature: &str,
    ) -> Result<reqwest::Response, anyhow::Error> {
        Ok(self
            .http
            .post(self.endpoint())
            .header("content-type", "application/json")
            .header("timestamp", timestamp)
            .header("nonce", nonce)
            .header("signature", signature)
            .body(body)
            .send()
            .await?)
    }

    /// GET the verification handshake for `plaintext`.
    pub async fn verify_url(&self, plaintext: &str) -> Result<reqwest::Response, anyhow::Error> {
        let check_str = self.encode(plaintext);
        let (timestamp, nonce, signature) = self.sign(&check_str);
        Ok(self
            .http
            .get(self.endpoint())
            .query(&[("check_str", check_str.as_str())])
            .header("timestamp", timestamp)
            .header("nonce", nonce)
            .header("signature", signature)
            .send()
            .await?)
    }
}
