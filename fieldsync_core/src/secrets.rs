//! Encryption of OAuth tokens at rest.
//!
//! `TokenCipher` encrypts with AES-256-GCM. Stored ciphertext is the 12-byte
//! random nonce followed by the AEAD output.

use crate::{Error, Result};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use std::path::Path;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(master_key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(master_key)),
        }
    }

    /// Load the master key from `path`, or generate one if it doesn't exist.
    pub fn generate_or_load_key(path: &Path) -> std::io::Result<[u8; 32]> {
        if path.exists() {
            let bytes = std::fs::read(path)?;
            if bytes.len() != 32 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "master key file must be exactly 32 bytes, got {}",
                        bytes.len()
                    ),
                ));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            Ok(key)
        } else {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, key)?;
            tracing::info!(path = %path.display(), "generated new master key");
            Ok(key)
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::BackendMessage(format!("encrypt: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::BackendMessage(
                "ciphertext too short (missing nonce)".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| Error::BackendMessage(format!("decrypt: {e}")))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, data: &[u8]) -> Result<String> {
        let bytes = self.decrypt(data)?;
        String::from_utf8(bytes).map_err(|e| Error::backend("decrypted token is not utf-8", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip_uses_fresh_nonces() {
        let cipher = TokenCipher::new(&[42u8; 32]);
        let a = cipher.encrypt_str("access-token").unwrap();
        let b = cipher.encrypt_str("access-token").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt_str(&a).unwrap(), "access-token");
    }

    #[test]
    fn tampered_or_short_ciphertext_fails() {
        let cipher = TokenCipher::new(&[7u8; 32]);
        let mut ct = cipher.encrypt_str("refresh").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xff;
        assert!(cipher.decrypt(&ct).is_err());
        assert!(cipher.decrypt(&[1, 2, 3]).is_err());
    }

    #[test]
    fn wrong_key_cannot_decrypt() {
        let ct = TokenCipher::new(&[1u8; 32]).encrypt_str("x").unwrap();
        assert!(TokenCipher::new(&[2u8; 32]).decrypt(&ct).is_err());
    }

    #[test]
    fn master_key_is_generated_then_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/master.key");
        let first = TokenCipher::generate_or_load_key(&path).unwrap();
        let second = TokenCipher::generate_or_load_key(&path).unwrap();
        assert_eq!(first, second);

        std::fs::write(&path, b"short").unwrap();
        assert!(TokenCipher::generate_or_load_key(&path).is_err());
    }
}
