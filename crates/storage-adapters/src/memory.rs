//! In-process store for tests and throwaway deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use domains::{KvStore, StoreError};
use serde_json::Value;

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn stores_and_removes_values() {
        let store = MemoryStore::new();
        store.set("thread-1", json!({ "id": 1 })).await.unwrap();
        store.set("SYS", json!({ "postCount": 1 })).await.unwrap();

        assert_eq!(store.get("thread-1").await.unwrap(), Some(json!({ "id": 1 })));
        assert_eq!(store.list_keys().await.unwrap(), vec!["SYS", "thread-1"]);

        store.remove("thread-1").await.unwrap();
        store.remove("thread-1").await.unwrap();
        assert_eq!(store.get("thread-1").await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }
}
