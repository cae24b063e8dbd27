//! Webhook payload decoding.
//!
//! With an AES key configured, payloads are Base64 AES-256-CBC ciphertext
//! (PKCS#7 padding, IV = first 16 key bytes). Without one, payloads are plain
//! Base64. Any failure is an error; partial plaintext is never returned.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use common::secret::{ExposeSecret, SecretBox, SecretString};
use thiserror::Error;

use crate::errors::BridgeError;

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// Decoded key length for AES-256.
pub const KEY_LEN: usize = 32;

const IV_LEN: usize = 16;

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("Invalid AES key: {0}")]
    InvalidKey(String),

    #[error("Payload is empty")]
    Empty,

    #[error("Payload is not valid Base64: {0}")]
    InvalidBase64(String),

    #[error("Ciphertext could not be decrypted: {0}")]
    InvalidCiphertext(String),

    #[error("Plaintext is not valid UTF-8")]
    InvalidUtf8,
}

impl From<PayloadError> for BridgeError {
    fn from(err: PayloadError) -> Self {
        BridgeError::Decryption(err.to_string())
    }
}

/// Encodes and decodes webhook payloads for one configured key.
pub struct PayloadCodec {
    key: Option<SecretBox<[u8; KEY_LEN]>>,
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("encrypted", &self.key.is_some())
            .finish()
    }
}

impl PayloadCodec {
    /// Build a codec. `None` selects plain Base64 payloads.
    ///
    /// # Errors
    ///
    /// Returns `PayloadError::InvalidKey` when the key does not decode to
    /// exactly 32 bytes.
    pub fn new(aes_key: Option<&SecretString>) -> Result<Self, PayloadError> {
        let key = match aes_key {
            Some(encoded) => Some(decode_key(encoded.expose_secret())?),
            None => None,
        };
        Ok(Self { key })
    }

    /// Whether payloads are encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Recover the UTF-8 plaintext carried by `data`.
    ///
    /// An empty plain payload decodes to an empty string; an empty
    /// encrypted payload is an error.
    pub fn decode(&self, data: &str) -> Result<String, PayloadError> {
        if data.is_empty() {
            return match self.key {
                Some(_) => Err(PayloadError::Empty),
                None => Ok(String::new()),
            };
        }

        let raw = STANDARD
            .decode(data.trim())
            .map_err(|e| PayloadError::InvalidBase64(e.to_string()))?;

        let plaintext = match &self.key {
            Some(key) => decrypt(key.expose_secret(), &raw)?,
            None => raw,
        };

        String::from_utf8(plaintext).map_err(|_| PayloadError::InvalidUtf8)
    }

    /// Produce the wire form of `plaintext`, the inverse of [`Self::decode`].
    pub fn encode(&self, plaintext: &str) -> Result<String, PayloadError> {
        let bytes = match &self.key {
            Some(key) => {
                let key = key.expose_secret();
                let iv = key
                    .get(..IV_LEN)
                    .ok_or_else(|| PayloadError::InvalidKey("key shorter than IV".into()))?;
                Aes256CbcEnc::new_from_slices(key, iv)
                    .map_err(|e| PayloadError::InvalidKey(e.to_string()))?
                    .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes())
            }
            None => plaintext.as_bytes().to_vec(),
        };
        Ok(STANDARD.encode(bytes))
    }
}

/// Decode a Base64 key, appending the `=` padding WeMeet strips.
fn decode_key(encoded: &str) -> Result<SecretBox<[u8; KEY_LEN]>, PayloadError> {
    let mut padded = encoded.trim().to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let bytes = STANDARD
        .decode(padded.as_bytes())
        .map_err(|e| PayloadError::InvalidKey(format!("not valid Base64: {e}")))?;

    let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
        PayloadError::InvalidKey(format!(
            "expected {KEY_LEN} bytes after decoding, got {}",
            bytes.len()
        ))
    })?;

    Ok(SecretBox::new(Box::new(key)))
}

fn decrypt(key: &[u8; KEY_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let iv = key
        .get(..IV_LEN)
        .ok_or_else(|| PayloadError::InvalidKey("key shorter than IV".into()))?;

    Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| PayloadError::InvalidKey(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| PayloadError::InvalidCiphertext(e.to_string()))
}
