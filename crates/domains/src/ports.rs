//! # Ports
//!
//! Any persistence adapter must implement [`KvStore`] to back the content
//! store and the plugin substrate.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::errors::StoreError;

/// Async key-value persistence contract.
///
/// Values are arbitrary JSON documents. Removing an absent key succeeds.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Typed helpers over [`KvStore`].
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set_as<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.set(key, serde_json::to_value(value)?).await
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}
