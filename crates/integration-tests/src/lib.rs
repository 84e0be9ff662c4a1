//! Shared fixtures for the cross-crate tests under `tests/`.

use std::sync::Arc;

use domains::{KvStore, RawSubmission};
use services::{ContentStore, StoreSettings};

/// A submission with every wire field present.
pub fn submission(subject: &str, body: &str, trip: &str) -> RawSubmission {
    [("subject", subject), ("email", ""), ("content", body), ("trip", trip)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn reply(body: &str) -> RawSubmission {
    submission("", body, "")
}

/// A content store over `backend` with its system record initialized.
pub async fn ready_store(backend: Arc<dyn KvStore>, max_threads: usize) -> Arc<ContentStore> {
    let settings = StoreSettings { max_threads_per_board: max_threads, ..StoreSettings::default() };
    let store = Arc::new(ContentStore::new(backend, settings));
    store.init_system().await.expect("system record");
    store
}
