//! Credential cipher for mailbox passwords at rest
//!
//! AES-256-GCM with a random 96-bit nonce per encryption. The stored form is
//! `base64(nonce || ciphertext)`; only ciphertext ever reaches the database or
//! the control API. The master key comes from `CRYPTO_KEY` as 64 hex
//! characters.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};

use crate::errors::{AppError, AppResult};

const NONCE_LEN: usize = 12;

/// Symmetric cipher wrapping mailbox credentials
///
/// Constructed once at startup and shared; encryption is only used by
/// operator tooling, the relay itself decrypts inside the worker constructor
/// and the supervisor's probe path.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Build the cipher from a hex-encoded 32-byte master key
    ///
    /// # Errors
    ///
    /// Returns `Crypto` if the key is not valid hex or not exactly 32 bytes.
    pub fn from_hex_key(key: &SecretString) -> AppResult<Self> {
        let bytes = hex::decode(key.expose_secret())
            .map_err(|e| AppError::Crypto(format!("master key is not valid hex: {e}")))?;
        let cipher = Aes256Gcm::new_from_slice(&bytes)
            .map_err(|_| AppError::Crypto("master key must be 32 bytes (64 hex chars)".to_owned()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext password into its stored form
    pub fn encrypt_password(&self, plaintext: &str) -> AppResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| AppError::Crypto("encryption failed".to_owned()))?;
        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(payload))
    }

    /// Decrypt a stored password
    ///
    /// The plaintext is wrapped in [`SecretString`] so it cannot end up in
    /// logs; callers expose it only at the IMAP LOGIN boundary.
    ///
    /// # Errors
    ///
    /// Returns `Crypto` on malformed payloads or authentication-tag mismatch
    /// (wrong key or tampered ciphertext).
    pub fn decrypt_password(&self, stored: &str) -> AppResult<SecretString> {
        let payload = BASE64
            .decode(stored)
            .map_err(|e| AppError::Crypto(format!("stored credential is not valid base64: {e}")))?;
        if payload.len() <= NONCE_LEN {
            return Err(AppError::Crypto("stored credential is too short".to_owned()));
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AppError::Crypto("decryption failed".to_owned()))?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| AppError::Crypto("decrypted credential is not utf-8".to_owned()))?;
        Ok(SecretString::new(plaintext.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::CredentialCipher;
    use secrecy::{ExposeSecret, SecretString};

    fn test_cipher() -> CredentialCipher {
        let key = SecretString::new(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
                .to_owned()
                .into(),
        );
        CredentialCipher::from_hex_key(&key).expect("valid key")
    }

    #[test]
    fn round_trips_a_password() {
        let cipher = test_cipher();
        let stored = cipher.encrypt_password("hunter2").expect("encrypt");
        let decrypted = cipher.decrypt_password(&stored).expect("decrypt");
        assert_eq!(decrypted.expose_secret(), "hunter2");
    }

    #[test]
    fn distinct_nonces_produce_distinct_ciphertexts() {
        let cipher = test_cipher();
        let a = cipher.encrypt_password("hunter2").expect("encrypt");
        let b = cipher.encrypt_password("hunter2").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_tampered_payloads() {
        let cipher = test_cipher();
        assert!(cipher.decrypt_password("not base64!!").is_err());
        assert!(cipher.decrypt_password("AAAA").is_err());
        let mut stored = cipher.encrypt_password("hunter2").expect("encrypt");
        stored.replace_range(..2, "zz");
        assert!(cipher.decrypt_password(&stored).is_err());
    }

    #[test]
    fn rejects_malformed_keys() {
        let short = SecretString::new("deadbeef".to_owned().into());
        assert!(CredentialCipher::from_hex_key(&short).is_err());
        let not_hex = SecretString::new("zz".repeat(32).into());
        assert!(CredentialCipher::from_hex_key(&not_hex).is_err());
    }
}
