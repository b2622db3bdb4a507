//! SQLite-backed token cache store
//!
//! Stores records in `token_cache.db`. The `home_id` and `cache` columns hold
//! `FieldCipher` envelopes, never plaintext.

use super::{RecordId, StoreError, TokenCacheRecord, TokenCacheStore};
use crate::secure_store::FieldCipher;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Encrypted token cache store with SQLite backend
pub struct SqliteTokenCacheStore {
    db_path: PathBuf,
    db: Arc<Mutex<Connection>>,
    cipher: FieldCipher,
}

impl SqliteTokenCacheStore {
    /// Open (or create) the database at `db_path`
    pub fn open(db_path: impl AsRef<Path>, cipher: FieldCipher) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS token_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                home_id TEXT NOT NULL,
                cache TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            db_path,
            db: Arc::new(Mutex::new(conn)),
            cipher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn seal_optional(&self, value: Option<&str>) -> Result<Option<String>> {
        value.map(|v| self.cipher.encrypt(v)).transpose()
    }

    fn load_record(&self, id: RecordId) -> Result<Option<TokenCacheRecord>> {
        let row: Option<(String, Option<String>)> = self
            .connection()
            .query_row(
                "SELECT home_id, cache FROM token_cache WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query token cache")?;

        let Some((home_id, cache)) = row else {
            return Ok(None);
        };

        let home_account_id = self
            .cipher
            .decrypt(&home_id)
            .context("Failed to decrypt home account id")?;
        let serialized_cache = cache
            .map(|c| self.cipher.decrypt(&c))
            .transpose()
            .context("Failed to decrypt token cache")?;

        Ok(Some(TokenCacheRecord {
            id,
            home_account_id,
            serialized_cache,
        }))
    }

    fn save_record(&self, record: &TokenCacheRecord) -> Result<usize> {
        let home_id = self.cipher.encrypt(&record.home_account_id)?;
        let cache = self.seal_optional(record.serialized_cache.as_deref())?;

        let updated = self.connection().execute(
            "UPDATE token_cache SET home_id = ?1, cache = ?2, updated_at = ?3 WHERE id = ?4",
            params![home_id, cache, Utc::now().to_rfc3339(), record.id],
        )?;
        Ok(updated)
    }

    fn create_record(&self) -> Result<TokenCacheRecord> {
        let home_id = self.cipher.encrypt("")?;
        let now = Utc::now().to_rfc3339();

        let conn = self.connection();
        conn.execute(
            "INSERT INTO token_cache (home_id, cache, created_at, updated_at)
             VALUES (?1, NULL, ?2, ?3)",
            params![home_id, now, now],
        )?;

        Ok(TokenCacheRecord {
            id: conn.last_insert_rowid(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl TokenCacheStore for SqliteTokenCacheStore {
    async fn load(&self, id: RecordId) -> Result<TokenCacheRecord, StoreError> {
        self.load_record(id)?.ok_or(StoreError::NotFound(id))
    }

    async fn save(&self, record: &TokenCacheRecord) -> Result<(), StoreError> {
        match self.save_record(record)? {
            0 => Err(StoreError::NotFound(record.id)),
            _ => {
                tracing::debug!("Saved token cache {} to {:?}", record.id, self.db_path);
                Ok(())
            }
        }
    }

    async fn create(&self) -> Result<TokenCacheRecord, StoreError> {
        let record = self.create_record()?;
        tracing::info!("Created token cache entry {}", record.id);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> SqliteTokenCacheStore {
        SqliteTokenCacheStore::open(
            dir.path().join("token_cache.db"),
            FieldCipher::new("test-key"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = open_store(&dir);
            let mut record = store.create().await.unwrap();
            record.home_account_id = "oid.tid".to_string();
            record.serialized_cache = Some(r#"{"accounts":{}}"#.to_string());
            store.save(&record).await.unwrap();
            record.id
        };

        let store = open_store(&dir);
        let record = store.load(id).await.unwrap();
        assert_eq!(record.home_account_id, "oid.tid");
        assert_eq!(record.serialized_cache.as_deref(), Some(r#"{"accounts":{}}"#));
    }

    #[tokio::test]
    async fn columns_are_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut record = store.create().await.unwrap();
        record.home_account_id = "visible-home-id".to_string();
        record.serialized_cache = Some("visible-refresh-token".to_string());
        store.save(&record).await.unwrap();

        let (home_id, cache): (String, String) = store
            .connection()
            .query_row(
                "SELECT home_id, cache FROM token_cache WHERE id = ?1",
                params![record.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(!home_id.contains("visible-home-id"));
        assert!(!cache.contains("visible-refresh-token"));
    }

    #[tokio::test]
    async fn fresh_record_has_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let record = store.create().await.unwrap();
        let loaded = store.load(record.id).await.unwrap();
        assert!(!loaded.has_home_account());
        assert!(loaded.serialized_cache.is_none());
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(matches!(store.load(42).await, Err(StoreError::NotFound(42))));

        let ghost = TokenCacheRecord {
            id: 42,
            ..Default::default()
        };
        assert!(matches!(
            store.save(&ghost).await,
            Err(StoreError::NotFound(42))
        ));
    }
}
