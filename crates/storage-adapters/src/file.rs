//! Filesystem store: one JSON document per key.
//!
//! Keys made only of `[A-Za-z0-9_.-]` map to `<key>.json`; any other key is
//! hex-encoded as `~<hex>.json`. Writes go to a temporary file that is then
//! renamed over the target, so a reader never sees a half-written record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use domains::{KvStore, StoreError};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

const EXTENSION: &str = ".json";
const TMP_SUFFIX: &str = ".tmp";
const ENCODED_PREFIX: char = '~';

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "file store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(file_name(key))
    }
}

fn is_plain(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn file_name(key: &str) -> String {
    if is_plain(key) {
        format!("{key}{EXTENSION}")
    } else {
        format!("{ENCODED_PREFIX}{}{EXTENSION}", hex::encode(key))
    }
}

fn key_from_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(EXTENSION)?;
    match stem.strip_prefix(ENCODED_PREFIX) {
        Some(encoded) => hex::decode(encoded).ok().and_then(|b| String::from_utf8(b).ok()),
        None => is_plain(stem).then(|| stem.to_string()),
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let target = self.path_for(key);
        let mut tmp = target.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let bytes = serde_json::to_vec(&value)?;
        fs::write(&tmp, &bytes).await?;
        if let Err(e) = fs::rename(&tmp, &target).await {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                warn!(path = %tmp.display(), error = %cleanup, "failed to remove temporary file");
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = key_from_file_name(name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
