use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domains::{KvStore, StoreError};
use integration_tests::{ready_store, reply, submission};
use serde_json::Value;
use services::ContentStore;
use storage_adapters::MemoryStore;

/// Delays every thread record write so that a competing operation can
/// observe the store while the write is in flight.
struct SlowThreadSets {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl KvStore for SlowThreadSets {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        if key.starts_with("thread-") {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key).await
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_keys().await
    }
}

/// Waits for the background pruner to remove `thread_id`.
async fn wait_until_gone(store: &ContentStore, thread_id: u64) -> bool {
    for _ in 0..200 {
        if store.thread(thread_id).is_none() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn tick() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test]
async fn test_background_pruner_evicts_least_recent_activity() {
    let store = ready_store(Arc::new(MemoryStore::new()), 3).await;
    let pruner = store.start_pruner();

    let t1 = store.create_thread("b", &submission("", "one", "")).await.unwrap();
    tick().await;
    let t2 = store.create_thread("b", &submission("", "two", "")).await.unwrap();
    tick().await;
    let r = store.create_post(t1, &reply("bump")).await.unwrap();
    tick().await;
    let t3 = store.create_thread("b", &submission("", "three", "")).await.unwrap();

    assert!(wait_until_gone(&store, t2).await, "thread {t2} was not pruned");
    assert!(store.thread(t1).is_some());
    assert!(store.post(r).is_some());
    assert!(store.thread(t3).is_some());
    assert_eq!(store.pruned_total(), 1);

    // Other boards are unaffected.
    store.create_thread("cyb", &submission("", "elsewhere", "")).await.unwrap();
    assert_eq!(store.threads_per_board()["cyb"], 1);

    drop(store);
    tokio::time::timeout(Duration::from_secs(1), pruner)
        .await
        .expect("pruner stops once the store is dropped")
        .unwrap();
}

#[tokio::test]
async fn test_pinned_threads_are_never_pruned() {
    let store = ready_store(Arc::new(MemoryStore::new()), 2).await;
    let t1 = store.create_thread("b", &submission("", "keep", "Mod ##pin")).await.unwrap();
    store.set_moderators([store.thread(t1).unwrap().signature_tag.unwrap()]);
    store.pin(t1, "Mod ##pin").await.unwrap();
    tick().await;

    let t2 = store.create_thread("b", &submission("", "old", "")).await.unwrap();
    assert_eq!(store.prune("b").await.unwrap(), Some(t2));
    assert_eq!(store.prune("b").await.unwrap(), None);
    assert!(store.thread(t1).unwrap().pinned);
}

#[tokio::test]
async fn test_pin_in_flight_protects_the_prune_candidate() {
    let backend = SlowThreadSets { inner: MemoryStore::new(), delay: Duration::from_millis(200) };
    let store = ready_store(Arc::new(backend), 2).await;
    let a = store.create_thread("b", &submission("", "older", "Mod ##pin")).await.unwrap();
    tick().await;
    let b = store.create_thread("b", &submission("", "newer", "")).await.unwrap();
    store.set_moderators([store.thread(a).unwrap().signature_tag.unwrap()]);

    let pinning = {
        let store = store.clone();
        tokio::spawn(async move { store.pin(a, "Mod ##pin").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // `a` is still unpinned in the snapshot, but the pin owns its lock.
    let pruned = store.prune("b").await.unwrap();
    pinning.await.unwrap().unwrap();

    assert_eq!(pruned, None);
    assert!(store.thread(a).unwrap().pinned);
    assert!(store.thread(b).is_some());
    assert_eq!(store.pruned_total(), 0);
}

#[tokio::test]
async fn test_reply_in_flight_protects_the_prune_candidate() {
    let backend = SlowThreadSets { inner: MemoryStore::new(), delay: Duration::from_millis(200) };
    let store = ready_store(Arc::new(backend), 2).await;
    let a = store.create_thread("b", &submission("", "older", "")).await.unwrap();
    tick().await;
    store.create_thread("b", &submission("", "newer", "")).await.unwrap();

    let replying = {
        let store = store.clone();
        tokio::spawn(async move { store.create_post(a, &reply("bump")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(store.prune("b").await.unwrap(), None);
    let r = replying.await.unwrap().unwrap();
    assert_eq!(store.thread(a).unwrap().reply_ids, vec![r]);
}

#[tokio::test]
async fn test_replies_are_removed_with_their_thread() {
    let store = ready_store(Arc::new(MemoryStore::new()), 2).await;
    let t1 = store.create_thread("b", &submission("", "victim", "")).await.unwrap();
    let replies = [
        store.create_post(t1, &reply("a")).await.unwrap(),
        store.create_post(t1, &reply("b")).await.unwrap(),
    ];
    tick().await;
    store.create_thread("b", &submission("", "survivor", "")).await.unwrap();
    tick().await;
    store.create_thread("b", &submission("", "newest", "")).await.unwrap();

    assert_eq!(store.prune("b").await.unwrap(), Some(t1));
    assert!(replies.iter().all(|id| store.post(*id).is_none()));
}
