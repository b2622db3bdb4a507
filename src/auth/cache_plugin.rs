//! Bridges the identity client's cache hooks to the encrypted store
//!
//! The adapter is built from the session's record handle and the store; it
//! never holds a process-wide reference.

use super::identity::{CachePlugin, TokenCache};
use super::AuthError;
use crate::storage::{TokenCacheRecord, TokenCacheStore};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared handle to the record a login session works on
pub type SharedRecord = Arc<Mutex<TokenCacheRecord>>;

pub struct CacheAdapter {
    record: SharedRecord,
    store: Arc<dyn TokenCacheStore>,
}

impl CacheAdapter {
    pub fn new(record: SharedRecord, store: Arc<dyn TokenCacheStore>) -> Self {
        Self { record, store }
    }

    pub fn record(&self) -> &SharedRecord {
        &self.record
    }

    /// Write the current record through to the store
    pub async fn persist(&self) -> Result<(), AuthError> {
        let record = self.record.lock().await.clone();
        self.store.save(&record).await?;
        Ok(())
    }
}

#[async_trait]
impl CachePlugin for CacheAdapter {
    async fn before_access(&self, cache: &mut TokenCache) -> Result<(), AuthError> {
        let record = self.record.lock().await;
        let blob = record
            .serialized_cache
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty());

        match blob {
            Some(blob) => {
                if let Err(e) = cache.deserialize(blob) {
                    // A blob we cannot read is treated like a first run
                    tracing::warn!("Discarding unreadable token cache {}: {}", record.id, e);
                    *cache = TokenCache::default();
                }
            }
            None => *cache = TokenCache::default(),
        }
        Ok(())
    }

    async fn after_access(&self, cache: &TokenCache, changed: bool) -> Result<(), AuthError> {
        if !changed {
            return Ok(());
        }

        let serialized = cache.serialize()?;
        let snapshot = {
            let mut record = self.record.lock().await;
            record.serialized_cache = Some(serialized);
            record.clone()
        };
        self.store.save(&snapshot).await?;
        tracing::debug!("Persisted token cache {}", snapshot.id);
        Ok(())
    }
}
