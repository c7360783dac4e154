//! Encrypted credential persistence.

use super::key_manager::{CredentialError, KeyManager};
use super::order_store::PersistenceError;
use crate::types::{EncryptedCredentials, ExchangeCredentials};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Per-tenant exchange credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Decrypted credentials for every exchange the tenant registered.
    async fn get_credentials_by_tenant(&self, tenant_id: &str) -> Result<Vec<ExchangeCredentials>, CredentialStoreError>;

    /// Encrypt and upsert by (tenant, exchange).
    async fn save_credentials(&self, tenant_id: &str, credentials: &ExchangeCredentials) -> Result<(), CredentialStoreError>;

    /// Returns false when nothing was stored for the pair.
    async fn remove_credentials(&self, tenant_id: &str, exchange: &str) -> Result<bool, CredentialStoreError>;
}

/// SQLite-backed credential store.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
    keys: KeyManager,
}

impl SqliteCredentialStore {
    pub fn new<P: AsRef<Path>>(path: P, keys: KeyManager) -> Result<Self, PersistenceError> {
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
            keys,
        };
        store.init_schema()?;
        info!("SQLite credential store initialized");
        Ok(store)
    }

    pub fn new_in_memory(keys: KeyManager) -> Result<Self, PersistenceError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            keys,
        };
        store.init_schema()?;
        debug!("In-memory SQLite credential store initialized");
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), PersistenceError> {
        self.conn.lock().execute(
            "CREATE TABLE IF NOT EXISTS exchange_credentials (
                tenant_id TEXT NOT NULL,
                exchange TEXT NOT NULL,
                api_key_encrypted TEXT NOT NULL,
                api_secret_encrypted TEXT NOT NULL,
                passphrase_encrypted TEXT,
                sandbox INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, exchange)
            )",
            [],
        )?;
        Ok(())
    }

    fn load_encrypted(&self, tenant_id: &str) -> Result<Vec<EncryptedCredentials>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT tenant_id, exchange, api_key_encrypted, api_secret_encrypted, passphrase_encrypted,
                        sandbox, created_at, updated_at
                 FROM exchange_credentials WHERE tenant_id = ?1 ORDER BY exchange",
            )
            .map_err(PersistenceError::from_sqlite)?;
        let rows = stmt
            .query_map(params![tenant_id], encrypted_from_row)
            .map_err(PersistenceError::from_sqlite)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn encrypted_from_row(row: &Row<'_>) -> rusqlite::Result<EncryptedCredentials> {
    Ok(EncryptedCredentials {
        tenant_id: row.get(0)?,
        exchange: row.get(1)?,
        api_key_encrypted: row.get(2)?,
        api_secret_encrypted: row.get(3)?,
        passphrase_encrypted: row.get(4)?,
        sandbox: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get_credentials_by_tenant(&self, tenant_id: &str) -> Result<Vec<ExchangeCredentials>, CredentialStoreError> {
        let mut credentials = Vec::new();
        for record in self.load_encrypted(tenant_id)? {
            match self.keys.decrypt_credentials(&record) {
                Ok(creds) => credentials.push(creds),
                // A record sealed under another key must not hide the rest
                Err(e) => warn!("Skipping {} credentials for {}: {}", record.exchange, tenant_id, e),
            }
        }
        Ok(credentials)
    }

    async fn save_credentials(&self, tenant_id: &str, credentials: &ExchangeCredentials) -> Result<(), CredentialStoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        let record = self.keys.encrypt_credentials(tenant_id, credentials, now)?;

        self.conn
            .lock()
            .execute(
                "INSERT INTO exchange_credentials (tenant_id, exchange, api_key_encrypted, api_secret_encrypted,
                                                   passphrase_encrypted, sandbox, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(tenant_id, exchange) DO UPDATE SET
                    api_key_encrypted = excluded.api_key_encrypted,
                    api_secret_encrypted = excluded.api_secret_encrypted,
                    passphrase_encrypted = excluded.passphrase_encrypted,
                    sandbox = excluded.sandbox,
                    updated_at = excluded.updated_at",
                params![
                    record.tenant_id,
                    record.exchange,
                    record.api_key_encrypted,
                    record.api_secret_encrypted,
                    record.passphrase_encrypted,
                    record.sandbox,
                    record.created_at,
                    record.updated_at,
                ],
            )
            .map_err(PersistenceError::from_sqlite)?;

        info!(
            "Saved {} credentials for {} (key {})",
            credentials.exchange,
            tenant_id,
            credentials.masked_key()
        );
        Ok(())
    }

    async fn remove_credentials(&self, tenant_id: &str, exchange: &str) -> Result<bool, CredentialStoreError> {
        let removed = self
            .conn
            .lock()
            .execute(
                "DELETE FROM exchange_credentials WHERE tenant_id = ?1 AND exchange = ?2",
                params![tenant_id, exchange.to_lowercase()],
            )
            .map_err(PersistenceError::from_sqlite)?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteCredentialStore {
        let keys = KeyManager::new("0123456789abcdef0123456789abcdef").unwrap();
        SqliteCredentialStore::new_in_memory(keys).unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = store();
        let creds = ExchangeCredentials::new("binance", "key-1", "secret-1");
        store.save_credentials("tenant", &creds).await.unwrap();

        let loaded = store.get_credentials_by_tenant("tenant").await.unwrap();
        assert_eq!(loaded, vec![creds]);
        assert!(store.get_credentials_by_tenant("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_secrets_encrypted_at_rest() {
        let store = store();
        store
            .save_credentials("tenant", &ExchangeCredentials::new("binance", "plain-key", "plain-secret"))
            .await
            .unwrap();
        let records = store.load_encrypted("tenant").unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].api_key_encrypted.contains("plain-key"));
        assert!(!records[0].api_secret_encrypted.contains("plain-secret"));
    }

    #[tokio::test]
    async fn test_upsert_by_tenant_and_exchange() {
        let store = store();
        store
            .save_credentials("tenant", &ExchangeCredentials::new("binance", "old", "old"))
            .await
            .unwrap();
        store
            .save_credentials("tenant", &ExchangeCredentials::new("binance", "new", "new").sandbox(true))
            .await
            .unwrap();

        let loaded = store.get_credentials_by_tenant("tenant").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].api_key, "new");
        assert!(loaded[0].sandbox);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = store();
        store
            .save_credentials("tenant", &ExchangeCredentials::new("binance", "k", "s"))
            .await
            .unwrap();
        assert!(store.remove_credentials("tenant", "BINANCE").await.unwrap());
        assert!(!store.remove_credentials("tenant", "binance").await.unwrap());
        assert!(store.get_credentials_by_tenant("tenant").await.unwrap().is_empty());
    }
}
