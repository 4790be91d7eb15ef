//! Password-derived authenticated encryption for stored text values.
//!
//! Keys come from PBKDF2-HMAC-SHA256 over a fixed application salt, so one
//! password always maps to the same key. Values are sealed with AES-256-GCM
//! under a fresh random nonce and stored as URL-safe base64 of
//! `version || nonce || ciphertext+tag`.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::Sha256;
use thiserror::Error;

const KDF_ROUNDS: u32 = 100_000;
const KDF_SALT: &[u8] = b"gapfill.channel-store.salt.v1";
const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncryptionError {
    #[error("failed to encrypt value: {0}")]
    Encryption(String),
    #[error("decryption failed: wrong password or corrupted ciphertext")]
    Decryption,
}

#[derive(Clone)]
pub struct CipherKey([u8; KEY_LEN]);

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

impl CipherKey {
    /// Slow by construction; callers that seal many values should derive once.
    pub fn derive(password: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key);
        Self(key)
    }

    pub fn encrypt(&self, text: &str) -> Result<String, EncryptionError> {
        let cipher = self.cipher()?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), text.as_bytes())
            .map_err(|err| EncryptionError::Encryption(err.to_string()))?;

        let mut payload = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        payload.push(FORMAT_VERSION);
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&sealed);
        Ok(URL_SAFE_NO_PAD.encode(payload))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, EncryptionError> {
        let payload = URL_SAFE_NO_PAD
            .decode(ciphertext.trim())
            .map_err(|_| EncryptionError::Decryption)?;
        if payload.len() <= 1 + NONCE_LEN || payload[0] != FORMAT_VERSION {
            return Err(EncryptionError::Decryption);
        }

        let (nonce, sealed) = payload[1..].split_at(NONCE_LEN);
        let plain = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| EncryptionError::Decryption)?;
        String::from_utf8(plain).map_err(|_| EncryptionError::Decryption)
    }

    fn cipher(&self) -> Result<Aes256Gcm, EncryptionError> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|err| EncryptionError::Encryption(err.to_string()))
    }
}

pub fn encrypt(text: &str, password: &str) -> Result<String, EncryptionError> {
    CipherKey::derive(password).encrypt(text)
}

pub fn decrypt(ciphertext: &str, password: &str) -> Result<String, EncryptionError> {
    CipherKey::derive(password).decrypt(ciphertext)
}

/// Random URL-safe password built from 12 to 22 random bytes.
pub fn generate_password() -> String {
    let mut rng = rand::rng();
    let len = rng.random_range(12..=22);
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}
