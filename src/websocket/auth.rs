use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

/// Default session lifetime (24 hours).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Resolves a client token to the tenant it belongs to.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<String>;
}

#[derive(Debug, Clone)]
struct TokenEntry {
    tenant_id: String,
    expires_at: i64,
}

impl TokenEntry {
    fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

/// In-memory session tokens issued by the embedding application.
pub struct SessionTokens {
    tokens: DashMap<String, TokenEntry>,
    ttl: Duration,
}

impl SessionTokens {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            ttl,
        }
    }

    /// Issue a fresh token for `tenant_id`.
    pub fn issue(&self, tenant_id: &str) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let expires_at = chrono::Utc::now().timestamp_millis() + self.ttl.as_millis() as i64;
        self.tokens.insert(
            token.clone(),
            TokenEntry {
                tenant_id: tenant_id.to_string(),
                expires_at,
            },
        );
        token
    }

    /// Register a token minted elsewhere.
    pub fn insert(&self, token: impl Into<String>, tenant_id: &str, expires_at: i64) {
        self.tokens.insert(
            token.into(),
            TokenEntry {
                tenant_id: tenant_id.to_string(),
                expires_at,
            },
        );
    }

    /// Register tokens that never expire, returning how many were added.
    pub fn load_static<'a, I>(&self, tokens: I) -> usize
    where
        I: IntoIterator<Item = &'a (String, String)>,
    {
        let mut count = 0;
        for (token, tenant_id) in tokens {
            self.insert(token.clone(), tenant_id, i64::MAX);
            count += 1;
        }
        count
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    /// Drop expired tokens.
    pub fn cleanup(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        self.tokens.retain(|_, entry| !entry.is_expired(now));
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for SessionTokens {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

#[async_trait]
impl TokenVerifier for SessionTokens {
    async fn verify(&self, token: &str) -> Option<String> {
        // Clone out of the map before touching it again
        let entry = self.tokens.get(token).map(|e| e.value().clone())?;
        if entry.is_expired(chrono::Utc::now().timestamp_millis()) {
            self.tokens.remove(token);
            debug!("Rejected expired session token");
            return None;
        }
        Some(entry.tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_and_verify() {
        let tokens = SessionTokens::default();
        let token = tokens.issue("tenant-1");
        assert_eq!(tokens.verify(&token).await.as_deref(), Some("tenant-1"));
        assert!(tokens.verify("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_token_removed() {
        let tokens = SessionTokens::default();
        tokens.insert("old", "tenant-1", chrono::Utc::now().timestamp_millis() - 1);
        assert!(tokens.verify("old").await.is_none());
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_static_tokens_survive_cleanup() {
        let tokens = SessionTokens::default();
        let pairs = vec![("tok-a".to_string(), "alice".to_string())];
        assert_eq!(tokens.load_static(&pairs), 1);

        tokens.cleanup();
        assert_eq!(tokio_test::block_on(tokens.verify("tok-a")).as_deref(), Some("alice"));
    }

    #[test]
    fn test_custom_ttl_token_expires_immediately() {
        let tokens = SessionTokens::new(std::time::Duration::ZERO);
        let token = tokens.issue("tenant-1");
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(tokio_test::block_on(tokens.verify(&token)).is_none());
    }

    #[tokio::test]
    async fn test_revoke_and_cleanup() {
        let tokens = SessionTokens::default();
        let token = tokens.issue("tenant-1");
        tokens.insert("stale", "tenant-2", 0);
        tokens.cleanup();
        assert_eq!(tokens.len(), 1);

        assert!(tokens.revoke(&token));
        assert!(!tokens.revoke(&token));
        assert!(tokens.verify(&token).await.is_none());
    }
}
