//! Exchange credential types.
//!
//! Plaintext credentials only live in memory while a connector is built;
//! `EncryptedCredentials` is the at-rest form.

use serde::{Deserialize, Serialize};

/// Plaintext API credentials for one exchange account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeCredentials {
    pub exchange: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub sandbox: bool,
}

impl ExchangeCredentials {
    pub fn new(exchange: impl Into<String>, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into().to_lowercase(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: None,
            sandbox: false,
        }
    }

    pub fn sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// API key safe for logs.
    pub fn masked_key(&self) -> String {
        mask_secret(&self.api_key)
    }
}

impl std::fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("exchange", &self.exchange)
            .field("api_key", &self.masked_key())
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

/// Credentials as persisted, secret fields hex-encoded ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedCredentials {
    pub tenant_id: String,
    pub exchange: String,
    pub api_key_encrypted: String,
    pub api_secret_encrypted: String,
    pub passphrase_encrypted: Option<String>,
    pub sandbox: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Keep the first and last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret_long() {
        assert_eq!(mask_secret("abcdefghijklmnop"), "abcd****mnop");
    }

    #[test]
    fn test_mask_secret_short() {
        assert_eq!(mask_secret("abc"), "****");
        assert_eq!(mask_secret("abcdefgh"), "****");
    }

    #[test]
    fn test_debug_hides_secret() {
        let creds = ExchangeCredentials::new("Binance", "key-1234567890", "super-secret-value");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("super-secret-value"));
        assert!(!debug.contains("key-1234567890"));
        assert!(debug.contains("key-****7890"));
        assert_eq!(creds.exchange, "binance");
    }
}
