//! Signed logout messages.
//!
//! A logout message tells a service that the session behind one of its
//! tickets has ended. On the wire it is
//!
//! ```text
//! base64url(json) "." base64url(ed25519 signature over the json bytes)
//! ```
//!
//! with both parts unpadded. Services verify the signature with the public
//! key published by [`LogoutSigner::public_key`].

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use ed25519_dalek::{
    PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH, Signature, Signer, SigningKey, VerifyingKey,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{LogoutError, Result};

/// The body of a logout notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase")]
pub struct LogoutMessage {
    /// Unique id of this message.
    #[builder(into)]
    pub message_id: String,
    /// The service ticket the service was given. Services index their local
    /// sessions by it.
    #[builder(into)]
    pub session_index: String,
    /// The service being notified.
    #[builder(into)]
    pub service: String,
    /// The principal whose session ended.
    #[builder(into)]
    pub principal_id: String,
    /// When the message was issued.
    #[builder(default = Utc::now())]
    pub issue_instant: DateTime<Utc>,
}

/// Signs logout messages with an Ed25519 key.
///
/// The seed is held in [`Zeroizing`] memory and the key is scrubbed on drop.
pub struct LogoutSigner {
    key: SigningKey,
}

impl LogoutSigner {
    /// Creates a signer from a 32-byte Ed25519 seed.
    #[must_use]
    pub fn from_seed(seed: &Zeroizing<[u8; SECRET_KEY_LENGTH]>) -> Self {
        Self { key: SigningKey::from_bytes(seed) }
    }

    /// Creates a signer from a base64url-encoded seed, as found in
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LogoutError::Signing`] if the value is not base64url or does
    /// not decode to 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded: Zeroizing<Vec<u8>> = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(encoded.trim())
                .map_err(|e| LogoutError::signing_with_source("seed is not base64url", e))?,
        );
        let seed: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(decoded.as_slice().try_into().map_err(|_| {
                LogoutError::signing(format!(
                    "expected {SECRET_KEY_LENGTH} seed bytes, got {}",
                    decoded.len()
                ))
            })?);
        Ok(Self::from_seed(&seed))
    }

    /// Creates a signer with a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        rand::rng().fill_bytes(&mut *seed);
        Self::from_seed(&seed)
    }

    /// Returns the verifying key services use to check notifications.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Returns the verifying key as unpadded base64url.
    #[must_use]
    pub fn public_key(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.key.verifying_key().to_bytes())
    }

    /// Encodes and signs `message`.
    ///
    /// # Errors
    ///
    /// Returns [`LogoutError::Signing`] if the message cannot be encoded.
    pub fn sign(&self, message: &LogoutMessage) -> Result<String> {
        let json = serde_json::to_vec(message)
            .map_err(|e| LogoutError::signing_with_source("message encoding failed", e))?;
        let signature = self.key.sign(&json);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&json),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

impl std::fmt::Debug for LogoutSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogoutSigner").field("public_key", &self.public_key()).finish()
    }
}

/// Checks a signed payload against `key` and returns the message it carries.
///
/// # Errors
///
/// Returns [`LogoutError::Signing`] if the payload is malformed, the
/// signature does not verify, or the JSON does not parse.
pub fn verify(payload: &str, key: &VerifyingKey) -> Result<LogoutMessage> {
    let (body, signature) = payload
        .split_once('.')
        .ok_or_else(|| LogoutError::signing("payload has no signature part"))?;
    let json = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|e| LogoutError::signing_with_source("body is not base64url", e))?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|e| LogoutError::signing_with_source("signature is not base64url", e))?;
    let signature = Signature::from_slice(&signature)
        .map_err(|e| LogoutError::signing_with_source("malformed signature", e))?;
    key.verify_strict(&json, &signature)
        .map_err(|e| LogoutError::signing_with_source("signature does not verify", e))?;
    serde_json::from_slice(&json)
        .map_err(|e| LogoutError::signing_with_source("message decoding failed", e))
}

/// Parses an unpadded base64url verifying key.
///
/// # Errors
///
/// Returns [`LogoutError::Signing`] if the key is malformed.
pub fn verifying_key_from_base64(encoded: &str) -> Result<VerifyingKey> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| LogoutError::signing_with_source("public key is not base64url", e))?;
    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        let len = bytes.len();
        LogoutError::signing(format!("expected {PUBLIC_KEY_LENGTH} key bytes, got {len}"))
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| LogoutError::signing_with_source("invalid Ed25519 key", e))
}
