//! Persistence Store (C11): namespaced, atomically-written JSON blobs.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Schema version written alongside every key's `.schema` sidecar (§6,
/// [SUPPLEMENT] 5).
pub const SNIFFLER_SCHEMA_VERSION: u32 = 1;

/// One directory under the user data path, one JSON file per key (§4.11).
pub struct PersistenceStore {
    root: PathBuf,
    /// Serializes writes to the same key; §5 specifies per-key atomicity,
    /// and a mutex here prevents two concurrent writers from racing on the
    /// same temp-file name.
    write_lock: Mutex<()>,
}

impl PersistenceStore {
    /// Create a store rooted at `root`, creating the directory if absent.
    /// Per §7, failure to initialize this directory is the only fatal
    /// condition in the whole system.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::persistence(format!("failed to create persistence root {}: {e}", root.display())))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key.replace('/', "__")))
    }

    fn schema_path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.schema", key.replace('/', "__")))
    }

    /// Serialize `value`, write to a temp file, fsync, then atomically
    /// rename into place (§4.11 "atomic per key").
    pub async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let content = serde_json::to_string_pretty(value)
            .map_err(|e| Error::persistence(format!("failed to serialize {key}: {e}")))?;

        let final_path = self.path_for(key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::persistence(format!("failed to create parent dir for {key}: {e}")))?;
        }

        let tmp_path = final_path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| Error::persistence(format!("failed to create temp file for {key}: {e}")))?;
        use tokio::io::AsyncWriteExt;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| Error::persistence(format!("failed to write temp file for {key}: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| Error::persistence(format!("failed to fsync temp file for {key}: {e}")))?;
        drop(file);

        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| Error::persistence(format!("failed to rename temp file into place for {key}: {e}")))?;

        fs::write(self.schema_path_for(key), SNIFFLER_SCHEMA_VERSION.to_string())
            .await
            .map_err(|e| Error::persistence(format!("failed to write schema sidecar for {key}: {e}")))?;

        Ok(())
    }

    /// Best-effort read: a malformed blob is quarantined and treated as
    /// absent rather than propagating a parse error (§4.11).
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::persistence(format!("failed to read {key}: {e}"))),
        };

        match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.quarantine(&path).await;
                tracing::warn!(key, error = %e, "quarantined malformed persistence blob");
                Ok(None)
            }
        }
    }

    async fn quarantine(&self, path: &Path) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let quarantined = path.with_extension(format!("corrupt.{ts}"));
        if let Err(e) = fs::rename(path, &quarantined).await {
            tracing::warn!(error = %e, "failed to quarantine malformed persistence blob");
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::persistence(format!("failed to delete {key}: {e}"))),
        }
        let _ = fs::remove_file(self.schema_path_for(key)).await;
        Ok(())
    }

    /// Trim request-history files older than `ttl`, matching §4.11's
    /// periodic cleanup. Only files under the `requests` namespace are
    /// considered; configs, mocks, and settings are never aged out here.
    pub async fn cleanup_requests(&self, ttl: Duration) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        let cutoff = SystemTime::now()
            .checked_sub(ttl)
            .unwrap_or(UNIX_EPOCH);

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::persistence(format!("failed to read persistence root: {e}")))?
        {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.contains("requests") || !name.ends_with(".json") {
                continue;
            }
            if let Ok(metadata) = entry.metadata().await {
                if let Ok(modified) = metadata.modified() {
                    if modified < cutoff {
                        if fs::remove_file(&path).await.is_ok() {
                            removed += 1;
                        }
                    }
                }
            }
        }
        Ok(removed)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = PersistenceStore::open(dir.path()).await.unwrap();

        let widget = Widget { name: "bolt".into(), count: 3 };
        store.save("proxies/normal/configs", &widget).await.unwrap();

        let loaded: Option<Widget> = store.load("proxies/normal/configs").await.unwrap();
        assert_eq!(loaded, Some(widget));
    }

    #[tokio::test]
    async fn missing_key_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = PersistenceStore::open(dir.path()).await.unwrap();
        let loaded: Option<Widget> = store.load("nope").await.unwrap();
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn malformed_blob_is_quarantined_not_fatal() {
        let dir = TempDir::new().unwrap();
        let store = PersistenceStore::open(dir.path()).await.unwrap();
        fs::write(dir.path().join("settings.json"), b"{not json")
            .await
            .unwrap();

        let loaded: Option<Widget> = store.load("settings").await.unwrap();
        assert_eq!(loaded, None);

        let mut found_quarantine = false;
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().contains(".corrupt.") {
                found_quarantine = true;
            }
        }
        assert!(found_quarantine);
    }

    #[tokio::test]
    async fn delete_removes_key_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let store = PersistenceStore::open(dir.path()).await.unwrap();
        store.save("settings", &Widget { name: "x".into(), count: 1 }).await.unwrap();
        store.delete("settings").await.unwrap();
        let loaded: Option<Widget> = store.load("settings").await.unwrap();
        assert_eq!(loaded, None);
    }
}
