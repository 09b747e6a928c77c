//! Durable record storage.
//!
//! The engine treats storage as an opaque key-value store holding JSON text.
//! Checkpoints, archives and catalog overrides all go through this trait.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Minimal CRUD contract for the durable store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, record: String) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

pub fn checkpoint_key(session_id: Uuid) -> String {
    format!("checkpoint/{session_id}")
}

pub fn archive_key(session_id: Uuid) -> String {
    format!("archive/{session_id}")
}

pub const THEME_CATALOG_KEY: &str = "catalog/themes";
pub const PHASE_CATALOG_KEY: &str = "catalog/phases";

/// Process-local store, used in tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, record: String) -> Result<(), StoreError> {
        self.records.write().await.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_replaces_previous_record() {
        let store = InMemoryStore::new();
        store.put("checkpoint/a", "one".into()).await.unwrap();
        store.put("checkpoint/a", "two".into()).await.unwrap();

        assert_eq!(store.get("checkpoint/a").await.unwrap().as_deref(), Some("two"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_and_missing_key() {
        let store = InMemoryStore::new();
        store.put("k", "v".into()).await.unwrap();
        store.delete("k").await.unwrap();

        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_key_scheme() {
        let id = Uuid::nil();
        assert_eq!(
            checkpoint_key(id),
            "checkpoint/00000000-0000-0000-0000-000000000000"
        );
        assert!(archive_key(id).starts_with("archive/"));
    }
}
