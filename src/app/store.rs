//! Persisted download status
//!
//! A small JSON file mapping download keys to the last known progress
//! string (`downloaded,total,bytes,complete`). It is read once at startup
//! and rewritten on completion, stop and deletion, so completed regions are
//! known after a restart without asking the engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::app::models::{DownloadKey, ProgressSnapshot};
use crate::constants::files;
use crate::errors::{StoreError, StoreResult};

/// On-disk `DownloadKey -> ProgressSnapshot` map
#[derive(Debug)]
pub struct PersistedStatusStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<DownloadKey, ProgressSnapshot>>,
}

impl PersistedStatusStore {
    /// Open the store file in `data_dir`, creating the directory if needed
    pub async fn open_in(data_dir: &Path) -> StoreResult<Self> {
        Self::open(data_dir.join(files::STATUS_STORE_FILE)).await
    }

    /// Open a store file; a missing file yields an empty store
    ///
    /// Entries whose key or value cannot be decoded are skipped with a
    /// warning. A file that is not a JSON object of strings is an error.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let raw: BTreeMap<String, String> = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let mut entries = BTreeMap::new();
        for (key, value) in raw {
            let parsed_key = match key.parse::<DownloadKey>() {
                Ok(k) => k,
                Err(e) => {
                    warn!("Skipping stored status with bad key '{}': {}", key, e);
                    continue;
                }
            };
            match value.parse::<ProgressSnapshot>() {
                Ok(snapshot) => {
                    entries.insert(parsed_key, snapshot);
                }
                Err(e) => warn!("Skipping stored status for {}: {}", key, e),
            }
        }

        info!("Loaded {} stored region statuses from {}", entries.len(), path.display());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &DownloadKey) -> Option<ProgressSnapshot> {
        self.entries.lock().await.get(key).copied()
    }

    /// All stored entries in key order
    pub async fn entries(&self) -> Vec<(DownloadKey, ProgressSnapshot)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Store a snapshot and write the file
    pub async fn put(&self, key: &DownloadKey, snapshot: ProgressSnapshot) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.clone(), snapshot);
        debug!("Persisting status {} = {}", key, snapshot);
        self.write(&entries).await
    }

    /// Remove a key and write the file; returns whether it was present
    pub async fn remove(&self, key: &DownloadKey) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        debug!("Removed stored status {}", key);
        self.write(&entries).await?;
        Ok(true)
    }

    /// Write atomically via a temporary file and rename
    async fn write(&self, entries: &BTreeMap<DownloadKey, ProgressSnapshot>) -> StoreResult<()> {
        let raw: BTreeMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.encode()))
            .collect();
        let json = serde_json::to_string_pretty(&raw)?;

        let temp_path = self
            .path
            .with_extension(format!("json{}", files::TEMP_FILE_SUFFIX));
        fs::write(&temp_path, json)
            .await
            .map_err(|source| StoreError::Io {
                path: temp_path.clone(),
                source,
            })?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_opens_empty() {
        let dir = TempDir::new().unwrap();
        let store = PersistedStatusStore::open_in(dir.path()).await.unwrap();
        assert!(store.entries().await.is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_put_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let key = DownloadKey::new("Oslo", "kartverket");
        let snapshot = ProgressSnapshot::new(4000, 4000, 73_000_000, true);

        let store = PersistedStatusStore::open_in(dir.path()).await.unwrap();
        store.put(&key, snapshot).await.unwrap();

        let reopened = PersistedStatusStore::open_in(dir.path()).await.unwrap();
        assert_eq!(reopened.get(&key).await, Some(snapshot));

        let content = std::fs::read_to_string(reopened.path()).unwrap();
        assert!(content.contains("\"Oslo-kartverket\": \"4000,4000,73000000,true\""));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let key = DownloadKey::new("Bergen", "osm");
        let store = PersistedStatusStore::open_in(dir.path()).await.unwrap();
        store.put(&key, ProgressSnapshot::new(1, 2, 3, false)).await.unwrap();

        assert!(store.remove(&key).await.unwrap());
        assert!(!store.remove(&key).await.unwrap());
        assert_eq!(store.get(&key).await, None);
    }

    #[tokio::test]
    async fn test_bad_entries_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(files::STATUS_STORE_FILE);
        std::fs::write(
            &path,
            r#"{"Oslo-kartverket": "10,20,300,false", "Tromsø-osm": "garbage", "nolayer": "1,1,1,true"}"#,
        )
        .unwrap();

        let store = PersistedStatusStore::open(&path).await.unwrap();
        let entries = store.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, DownloadKey::new("Oslo", "kartverket"));
    }

    #[tokio::test]
    async fn test_corrupted_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(files::STATUS_STORE_FILE);
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        let result = PersistedStatusStore::open(&path).await;
        assert!(matches!(result, Err(StoreError::Corrupted(_))));
    }
}
