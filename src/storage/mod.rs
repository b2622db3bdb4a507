//! Persistent storage for token caches
//!
//! One `TokenCacheRecord` exists per login identity. The serialized cache blob
//! and the linked home account id are both encrypted at rest by the SQLite
//! backend; everything above this module sees plain strings.
//!
//! <data_dir>/azure-broker-auth/
//! ├── token_cache.db                 # Encrypted token cache records
//! └── encryption.key                 # Field encryption key material (0600)

mod token_cache;

pub use token_cache::SqliteTokenCacheStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Identifier used to select a token cache record
pub type RecordId = i64;

/// Durable token cache entry for one login identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCacheRecord {
    pub id: RecordId,
    /// Identity provider account id; empty until the first successful code exchange
    pub home_account_id: String,
    /// Opaque cache blob owned by the identity client
    pub serialized_cache: Option<String>,
}

impl TokenCacheRecord {
    pub fn has_home_account(&self) -> bool {
        !self.home_account_id.trim().is_empty()
    }
}

/// Errors surfaced by a token cache store
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the selector
    #[error("No token cache entry found for account {0}")]
    NotFound(RecordId),

    /// Backend failure (I/O, SQL, encryption)
    #[error("Token cache storage failed: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Encrypted, durable home for token cache records
#[async_trait]
pub trait TokenCacheStore: Send + Sync {
    /// Load the record for `id`
    async fn load(&self, id: RecordId) -> Result<TokenCacheRecord, StoreError>;

    /// Persist an existing record in place
    async fn save(&self, record: &TokenCacheRecord) -> Result<(), StoreError>;

    /// First-time setup: insert a fresh record and return it with its assigned id
    async fn create(&self) -> Result<TokenCacheRecord, StoreError>;
}

/// In-process store, used for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryTokenCacheStore {
    records: Mutex<HashMap<RecordId, TokenCacheRecord>>,
    saves: Mutex<usize>,
}

impl MemoryTokenCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current persisted copy of a record, bypassing the trait
    pub fn snapshot(&self, id: RecordId) -> Option<TokenCacheRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }
}

#[async_trait]
impl TokenCacheStore for MemoryTokenCacheStore {
    async fn load(&self, id: RecordId) -> Result<TokenCacheRecord, StoreError> {
        self.snapshot(id).ok_or(StoreError::NotFound(id))
    }

    async fn save(&self, record: &TokenCacheRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if !records.contains_key(&record.id) {
            return Err(StoreError::NotFound(record.id));
        }
        records.insert(record.id, record.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    async fn create(&self) -> Result<TokenCacheRecord, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let id = records.keys().max().copied().unwrap_or(0) + 1;
        let record = TokenCacheRecord {
            id,
            ..Default::default()
        };
        records.insert(id, record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_assigns_ids_and_saves_in_place() {
        let store = MemoryTokenCacheStore::new();
        let mut record = store.create().await.unwrap();
        assert_eq!(record.id, 1);
        assert!(!record.has_home_account());

        record.home_account_id = "oid.tid".to_string();
        store.save(&record).await.unwrap();

        assert_eq!(store.load(1).await.unwrap().home_account_id, "oid.tid");
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.create().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn memory_store_reports_missing_records() {
        let store = MemoryTokenCacheStore::new();
        assert!(matches!(store.load(7).await, Err(StoreError::NotFound(7))));

        let ghost = TokenCacheRecord {
            id: 9,
            ..Default::default()
        };
        assert!(matches!(
            store.save(&ghost).await,
            Err(StoreError::NotFound(9))
        ));
    }
}
