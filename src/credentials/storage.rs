//! Secure key/value backends for the vault.
//!
//! Backends only know opaque string blobs addressed by key; all structure
//! and encryption is imposed by [`TokenVault`](super::TokenVault).

use crate::error::{IntegrationError, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// One write in an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Put { key: String, value: String },
    Delete { key: String },
}

impl StoreOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        StoreOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        StoreOp::Delete { key: key.into() }
    }
}

/// Get/set/delete of opaque blobs by key name.
///
/// Implementations must make [`apply`](SecureStore::apply) all-or-nothing:
/// either every op in the batch lands or none does.
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.apply(vec![StoreOp::put(key, value)]).await
    }

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()> {
        self.apply(vec![StoreOp::delete(key)]).await
    }

    async fn apply(&self, batch: Vec<StoreOp>) -> Result<()>;
}

/// Secure store backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE secrets (
///     key TEXT PRIMARY KEY,
///     value TEXT NOT NULL,      -- sealed blob
///     updated_at TEXT NOT NULL  -- ISO 8601 timestamp
/// );
/// ```
///
/// Batches run inside a single transaction.
pub struct SqliteSecureStore {
    conn: Mutex<Connection>,
}

impl SqliteSecureStore {
    /// Creates or opens a store at `db_path` (`":memory:"` for an ephemeral one).
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| IntegrationError::Storage(format!("failed to open database: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS secrets (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| IntegrationError::Storage(format!("failed to create secrets table: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| IntegrationError::Storage("secure store lock poisoned".to_string()))
    }
}

#[async_trait]
impl SecureStore for SqliteSecureStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM secrets WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn apply(&self, batch: Vec<StoreOp>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        for op in &batch {
            match op {
                StoreOp::Put { key, value } => {
                    tx.execute(
                        r#"
                        INSERT INTO secrets (key, value, updated_at)
                        VALUES (?1, ?2, ?3)
                        ON CONFLICT(key) DO UPDATE SET
                            value = excluded.value,
                            updated_at = excluded.updated_at
                        "#,
                        params![key, value, now],
                    )?;
                }
                StoreOp::Delete { key } => {
                    tx.execute("DELETE FROM secrets WHERE key = ?1", params![key])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }
}

/// In-process store. Contents are lost on drop.
#[derive(Default)]
pub struct MemorySecureStore {
    entries: DashMap<String, String>,
    // Held for the duration of a batch so readers never see half of one.
    batch_lock: Mutex<()>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self
            .batch_lock
            .lock()
            .map_err(|_| IntegrationError::Storage("secure store lock poisoned".to_string()))?;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn apply(&self, batch: Vec<StoreOp>) -> Result<()> {
        let _guard = self
            .batch_lock
            .lock()
            .map_err(|_| IntegrationError::Storage("secure store lock poisoned".to_string()))?;
        for op in batch {
            match op {
                StoreOp::Put { key, value } => {
                    self.entries.insert(key, value);
                }
                StoreOp::Delete { key } => {
                    self.entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_set_get_delete() {
        let store = SqliteSecureStore::open(":memory:").unwrap();

        store.set("auth_token", "blob-1").await.unwrap();
        assert_eq!(store.get("auth_token").await.unwrap().as_deref(), Some("blob-1"));

        store.set("auth_token", "blob-2").await.unwrap();
        assert_eq!(store.get("auth_token").await.unwrap().as_deref(), Some("blob-2"));

        store.delete("auth_token").await.unwrap();
        assert!(store.get("auth_token").await.unwrap().is_none());

        // Deleting again is fine
        store.delete("auth_token").await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_batch_is_applied_together() {
        let store = SqliteSecureStore::open(":memory:").unwrap();
        store.set("stale", "x").await.unwrap();

        store
            .apply(vec![
                StoreOp::put("a", "1"),
                StoreOp::put("b", "2"),
                StoreOp::delete("stale"),
            ])
            .await
            .unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
        assert!(store.get("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.db");

        {
            let store = SqliteSecureStore::open(&path).unwrap();
            store.set("salt", "abc").await.unwrap();
        }

        let store = SqliteSecureStore::open(&path).unwrap();
        assert_eq!(store.get("salt").await.unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySecureStore::new();
        assert!(store.is_empty());

        store
            .apply(vec![StoreOp::put("a", "1"), StoreOp::put("b", "2")])
            .await
            .unwrap();
        assert_eq!(store.len(), 2);

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
    }
}
