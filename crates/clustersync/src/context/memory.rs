//! In-process implementation of [`ContextStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::error::{ContextError, Result};
use super::store::ContextStore;

/// Desired-state tree kept in memory.
///
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct MemoryContextStore {
    entries: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Value> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| ContextError::NotFound(key.to_string()))
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryContextStore::new();
        let err = store.get("/context/1/").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_prefix_listing_and_delete() {
        let store = MemoryContextStore::new();
        store.put("/context/1/", json!("1")).await.unwrap();
        store.put("/context/1/app/a/", json!("a")).await.unwrap();
        store.put("/context/12/", json!("12")).await.unwrap();

        let keys = store.keys_with_prefix("/context/1/").await.unwrap();
        assert_eq!(keys, vec!["/context/1/", "/context/1/app/a/"]);

        store.delete_prefix("/context/1/").await.unwrap();
        assert!(!store.contains("/context/1/app/a/").await.unwrap());
        assert!(store.contains("/context/12/").await.unwrap());
    }
}
