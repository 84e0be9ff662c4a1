//! Bounds every store call with a timeout.
//!
//! A call that does not finish in time fails with
//! [`StoreError::Unavailable`] instead of stalling the request.

use std::time::Duration;

use async_trait::async_trait;
use domains::{KvStore, StoreError};
use serde_json::Value;
use tokio::time::timeout;
use tracing::warn;

pub struct TimeoutStore<S> {
    inner: S,
    limit: Duration,
}

impl<S: KvStore> TimeoutStore<S> {
    pub fn new(inner: S, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn unavailable(&self, op: &'static str, key: Option<&str>) -> StoreError {
        let timeout_ms = u64::try_from(self.limit.as_millis()).unwrap_or(u64::MAX);
        warn!(op, key = ?key, timeout_ms, "store call timed out");
        StoreError::Unavailable { op, key: key.map(str::to_string), timeout_ms }
    }
}

#[async_trait]
impl<S: KvStore> KvStore for TimeoutStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        timeout(self.limit, self.inner.get(key))
            .await
            .map_err(|_| self.unavailable("get", Some(key)))?
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        timeout(self.limit, self.inner.set(key, value))
            .await
            .map_err(|_| self.unavailable("set", Some(key)))?
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        timeout(self.limit, self.inner.remove(key))
            .await
            .map_err(|_| self.unavailable("remove", Some(key)))?
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        timeout(self.limit, self.inner.list_keys())
            .await
            .map_err(|_| self.unavailable("list_keys", None))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use serde_json::json;

    /// Never answers `get`.
    struct Stalled;

    #[async_trait]
    impl KvStore for Stalled {
        async fn get(&self, _key: &str) -> Result<Option<Value>, StoreError> {
            std::future::pending().await
        }
        async fn set(&self, _key: &str, _value: Value) -> Result<(), StoreError> {
            Ok(())
        }
        async fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn stalled_calls_become_unavailable() {
        let store = TimeoutStore::new(Stalled, Duration::from_millis(50));
        let err = store.get("SYS").await.unwrap_err();
        match err {
            StoreError::Unavailable { op, key, timeout_ms } => {
                assert_eq!(op, "get");
                assert_eq!(key.as_deref(), Some("SYS"));
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(store.set("SYS", json!(1)).await.is_ok());
    }

    #[tokio::test]
    async fn passes_through_fast_calls() {
        let store = TimeoutStore::new(MemoryStore::new(), Duration::from_secs(1));
        store.set("k", json!("v")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!("v")));
        assert_eq!(store.inner().len(), 1);
    }
}
