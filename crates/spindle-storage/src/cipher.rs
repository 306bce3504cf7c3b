//! AES-256-GCM sealing for stored refresh tokens.
//!
//! Format: base64 (standard alphabet) of `nonce || ciphertext`. The key is
//! supplied as 64 hex characters.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("token secret is not valid hex: {0}")]
    KeyHex(#[from] hex::FromHexError),
    #[error("token secret must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("sealed token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("sealed token is too short")]
    Truncated,
    #[error("sealed token failed authentication")]
    Authentication,
    #[error("decrypted token is not utf-8")]
    Utf8,
}

#[derive(Clone)]
pub struct TokenCipher {
    aead: Aes256Gcm,
}

impl TokenCipher {
    pub fn from_hex(secret: &str) -> Result<Self, CipherError> {
        let key = hex::decode(secret.trim())?;
        let aead = Aes256Gcm::new_from_slice(&key).map_err(|_| CipherError::KeyLength(key.len()))?;
        Ok(Self { aead })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Authentication)?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CipherError> {
        let data = STANDARD.decode(sealed.trim())?;
        if data.len() <= NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Authentication)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Utf8)
    }
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenCipher(<key>)")
    }
}
