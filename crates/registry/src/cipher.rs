//! Encryption of tickets at rest.
//!
//! Tickets are bearer secrets. A [`TicketCipher`] keeps them unreadable in a
//! shared store:
//!
//! - Ticket ids are replaced in store keys by `HMAC-SHA256(hash_key, id)`,
//!   base64url encoded, so a key listing reveals no usable id.
//! - Ticket values are sealed with ChaCha20-Poly1305 under a fresh random
//!   nonce. The store key is bound as associated data, so a value copied to
//!   another key fails to open.
//!
//! Sealed layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use sso_common_tickets::{ConfigError, Result, TicketError};
use zeroize::Zeroizing;

use crate::config::EncryptionConfig;

type HmacSha256 = Hmac<Sha256>;

/// Length of both keys in bytes.
pub const KEY_LENGTH: usize = 32;

const NONCE_LENGTH: usize = 12;

/// Hashes ticket ids and seals ticket values.
#[derive(Clone)]
pub struct TicketCipher {
    id_mac: HmacSha256,
    aead: ChaCha20Poly1305,
}

impl TicketCipher {
    /// Creates a cipher from raw keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the hash key is rejected by HMAC.
    pub fn new(
        hash_key: &Zeroizing<[u8; KEY_LENGTH]>,
        encryption_key: &Zeroizing<[u8; KEY_LENGTH]>,
    ) -> std::result::Result<Self, ConfigError> {
        let id_mac = <HmacSha256 as Mac>::new_from_slice(hash_key.as_ref())
            .map_err(|e| ConfigError::Invalid { field: "hash_key", reason: e.to_string() })?;
        let aead = ChaCha20Poly1305::new(Key::from_slice(encryption_key.as_ref()));
        Ok(Self { id_mac, aead })
    }

    /// Creates a cipher with fresh random keys.
    ///
    /// Tickets sealed by it are readable only by this instance and its
    /// clones.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn generate() -> std::result::Result<Self, ConfigError> {
        let mut hash_key = Zeroizing::new([0u8; KEY_LENGTH]);
        let mut encryption_key = Zeroizing::new([0u8; KEY_LENGTH]);
        let mut rng = rand::rng();
        rng.fill_bytes(&mut *hash_key);
        rng.fill_bytes(&mut *encryption_key);
        Self::new(&hash_key, &encryption_key)
    }

    /// Creates a cipher from base64url keys in configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a key is not base64url or not
    /// exactly 32 bytes.
    pub fn from_config(config: &EncryptionConfig) -> std::result::Result<Self, ConfigError> {
        let hash_key = decode_key("hash_key", &config.hash_key)?;
        let encryption_key = decode_key("encryption_key", &config.encryption_key)?;
        Self::new(&hash_key, &encryption_key)
    }

    /// Returns the store-key form of a ticket id.
    #[must_use]
    pub fn hash_id(&self, id: &str) -> String {
        let mut mac = self.id_mac.clone();
        mac.update(id.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Seals `plaintext` for storage under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Serialization`] if encryption fails.
    pub fn seal(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LENGTH];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: key })
            .map_err(|_| TicketError::serialization("ticket encryption failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Opens a value read from `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Serialization`] if the value is truncated,
    /// was sealed under other keys, or was moved from another store key.
    pub fn open(&self, key: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LENGTH {
            return Err(TicketError::serialization("sealed ticket is truncated"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
        self.aead
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: key })
            .map_err(|_| TicketError::serialization("ticket decryption failed"))
    }
}

impl std::fmt::Debug for TicketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketCipher").finish_non_exhaustive()
    }
}

fn decode_key(
    field: &'static str,
    encoded: &str,
) -> std::result::Result<Zeroizing<[u8; KEY_LENGTH]>, ConfigError> {
    let bytes = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| ConfigError::Invalid { field, reason: e.to_string() })?,
    );
    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    if bytes.len() != KEY_LENGTH {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("expected {KEY_LENGTH} bytes, got {}", bytes.len()),
        });
    }
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config(hash: [u8; 32], enc: [u8; 32]) -> EncryptionConfig {
        EncryptionConfig::builder()
            .hash_key(URL_SAFE_NO_PAD.encode(hash))
            .encryption_key(URL_SAFE_NO_PAD.encode(enc))
            .build()
    }

    #[test]
    fn id_hash_is_stable_and_keyed() {
        let a = TicketCipher::from_config(&config([1; 32], [2; 32])).unwrap();
        let b = TicketCipher::from_config(&config([3; 32], [2; 32])).unwrap();

        assert_eq!(a.hash_id("TGT-1-x"), a.hash_id("TGT-1-x"));
        assert_ne!(a.hash_id("TGT-1-x"), a.hash_id("TGT-2-x"));
        assert_ne!(a.hash_id("TGT-1-x"), b.hash_id("TGT-1-x"));
        assert!(!a.hash_id("TGT-1-x").contains("TGT"));
    }

    #[test]
    fn sealed_value_opens_only_under_its_key() {
        let cipher = TicketCipher::generate().unwrap();
        let sealed = cipher.seal(b"tickets/a", b"secret").unwrap();

        assert_eq!(cipher.open(b"tickets/a", &sealed).unwrap(), b"secret");
        assert!(cipher.open(b"tickets/b", &sealed).is_err());
        assert!(TicketCipher::generate().unwrap().open(b"tickets/a", &sealed).is_err());
        assert!(cipher.open(b"tickets/a", &sealed[..4]).is_err());
    }

    #[test]
    fn every_seal_uses_a_fresh_nonce() {
        let cipher = TicketCipher::generate().unwrap();
        assert_ne!(cipher.seal(b"k", b"v").unwrap(), cipher.seal(b"k", b"v").unwrap());
    }

    #[test]
    fn short_key_is_rejected() {
        let config = EncryptionConfig::builder()
            .hash_key(URL_SAFE_NO_PAD.encode([1u8; 16]))
            .encryption_key(URL_SAFE_NO_PAD.encode([2u8; 32]))
            .build();
        let err = TicketCipher::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "hash_key", .. }));
    }

    #[test]
    fn debug_hides_keys() {
        let cipher = TicketCipher::generate().unwrap();
        assert_eq!(format!("{cipher:?}"), "TicketCipher { .. }");
    }
}
