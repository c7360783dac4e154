//! At-rest encryption for exchange credentials.
//!
//! AES-256-GCM keyed by SHA-256 of the process secret. Each value gets a fresh
//! 96-bit nonce and is stored as `hex(nonce || ciphertext)`.

use crate::types::{EncryptedCredentials, ExchangeCredentials};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Shortest accepted process secret.
pub const MIN_SECRET_LEN: usize = 32;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Encryption secret must be at least {min} characters (got {actual})")]
    SecretTooShort { min: usize, actual: usize },

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: {0}")]
    Decryption(String),
}

/// Owns the credential cipher.
#[derive(Clone)]
pub struct KeyManager {
    cipher: Aes256Gcm,
}

impl KeyManager {
    pub fn new(secret: &str) -> Result<Self, CredentialError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(CredentialError::SecretTooShort {
                min: MIN_SECRET_LEN,
                actual: secret.len(),
            });
        }
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CredentialError::Encryption)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CredentialError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CredentialError> {
        let bytes = hex::decode(encoded).map_err(|e| CredentialError::Decryption(e.to_string()))?;
        if bytes.len() <= NONCE_LEN {
            return Err(CredentialError::Decryption("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decryption("authentication tag mismatch".to_string()))?;
        String::from_utf8(plaintext).map_err(|e| CredentialError::Decryption(e.to_string()))
    }

    pub fn encrypt_credentials(
        &self,
        tenant_id: &str,
        credentials: &ExchangeCredentials,
        now: i64,
    ) -> Result<EncryptedCredentials, CredentialError> {
        Ok(EncryptedCredentials {
            tenant_id: tenant_id.to_string(),
            exchange: credentials.exchange.clone(),
            api_key_encrypted: self.encrypt(&credentials.api_key)?,
            api_secret_encrypted: self.encrypt(&credentials.api_secret)?,
            passphrase_encrypted: credentials
                .passphrase
                .as_deref()
                .map(|p| self.encrypt(p))
                .transpose()?,
            sandbox: credentials.sandbox,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn decrypt_credentials(&self, encrypted: &EncryptedCredentials) -> Result<ExchangeCredentials, CredentialError> {
        Ok(ExchangeCredentials {
            exchange: encrypted.exchange.clone(),
            api_key: self.decrypt(&encrypted.api_key_encrypted)?,
            api_secret: self.decrypt(&encrypted.api_secret_encrypted)?,
            passphrase: encrypted
                .passphrase_encrypted
                .as_deref()
                .map(|p| self.decrypt(p))
                .transpose()?,
            sandbox: encrypted.sandbox,
        })
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_rejects_short_secret() {
        let err = KeyManager::new("too-short").unwrap_err();
        assert!(matches!(err, CredentialError::SecretTooShort { min: 32, actual: 9 }));
    }

    #[test]
    fn test_fresh_nonce_per_value() {
        let keys = KeyManager::new(SECRET).unwrap();
        let a = keys.encrypt("api-secret").unwrap();
        let b = keys.encrypt("api-secret").unwrap();
        assert_ne!(a, b);
        assert!(!a.contains("api-secret"));
        assert_eq!(keys.decrypt(&a).unwrap(), "api-secret");
    }

    #[test]
    fn test_wrong_key_fails() {
        let keys = KeyManager::new(SECRET).unwrap();
        let other = KeyManager::new("ffffffffffffffffffffffffffffffff").unwrap();
        let encrypted = keys.encrypt("value").unwrap();
        assert!(matches!(other.decrypt(&encrypted), Err(CredentialError::Decryption(_))));
        assert!(keys.decrypt("zz").is_err());
        assert!(keys.decrypt("00").is_err());
    }

    #[test]
    fn test_credentials_with_passphrase() {
        let keys = KeyManager::new(SECRET).unwrap();
        let mut creds = ExchangeCredentials::new("binance", "my-api-key", "my-api-secret").sandbox(true);
        creds.passphrase = Some("phrase".to_string());

        let encrypted = keys.encrypt_credentials("tenant-1", &creds, 42).unwrap();
        assert_eq!(encrypted.tenant_id, "tenant-1");
        assert!(encrypted.passphrase_encrypted.is_some());
        assert_eq!(keys.decrypt_credentials(&encrypted).unwrap(), creds);
    }
}
