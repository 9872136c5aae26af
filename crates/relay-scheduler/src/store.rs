//! Persisted scheduler state.

use async_trait::async_trait;
use crate::locks::lock_file;
use relay_core::lock::LockMode;
use relay_core::ports::{NightlyStamp, StampUpdate, StateStore};
use relay_core::settings::Layout;
use relay_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

const POLLER_STATE: &str = "state.json";
const NIGHTLY_STAMP: &str = "stamp.json";
const NIGHTLY_STAMP_LOCK: &str = "stamp.lock";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PollerState {
    last_revision: Option<String>,
}

/// JSON files under the data directory: one poller state per project and one
/// nightly stamp per project.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    layout: Layout,
}

impl FileStateStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    fn poller_file(&self, project: &str) -> PathBuf {
        self.layout.poller_dir(project).join(POLLER_STATE)
    }

    fn stamp_file(&self, project: &str) -> PathBuf {
        self.layout.nightly_dir(project).join(NIGHTLY_STAMP)
    }

    async fn read<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => {
                return Err(Error::StateStore(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        serde_json::from_str(&content).map_err(|e| {
            Error::StateStore(format!("Corrupt state file {}: {}", path.display(), e))
        })
    }

    async fn write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::StateStore(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let content = serde_json::to_string_pretty(value)?;
        // Atomic replace.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await.map_err(|e| {
            Error::StateStore(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            Error::StateStore(format!("Failed to replace {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn poller_revision(&self, project: &str) -> Result<Option<String>> {
        let state: PollerState = Self::read(&self.poller_file(project)).await?;
        Ok(state.last_revision)
    }

    async fn set_poller_revision(&self, project: &str, revision: &str) -> Result<()> {
        let state = PollerState {
            last_revision: Some(revision.to_string()),
        };
        Self::write(&self.poller_file(project), &state).await
    }

    async fn nightly_stamp(&self, project: &str) -> Result<NightlyStamp> {
        Self::read(&self.stamp_file(project)).await
    }

    async fn update_nightly_stamp(
        &self,
        project: &str,
        update: StampUpdate,
    ) -> Result<NightlyStamp> {
        let lock_path = self.layout.nightly_dir(project).join(NIGHTLY_STAMP_LOCK);
        let _lock = lock_file(lock_path.clone(), LockMode::Exclusive)
            .await
            .map_err(|e| {
                Error::StateStore(format!("Failed to lock {}: {}", lock_path.display(), e))
            })?;

        let path = self.stamp_file(project);
        let mut stamp: NightlyStamp = Self::read(&path).await?;
        if stamp.apply(&update) {
            Self::write(&path, &stamp).await?;
        }
        Ok(stamp)
    }
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    pollers: RwLock<HashMap<String, String>>,
    stamps: RwLock<HashMap<String, NightlyStamp>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn poller_revision(&self, project: &str) -> Result<Option<String>> {
        Ok(self.pollers.read().await.get(project).cloned())
    }

    async fn set_poller_revision(&self, project: &str, revision: &str) -> Result<()> {
        self.pollers
            .write()
            .await
            .insert(project.to_string(), revision.to_string());
        Ok(())
    }

    async fn nightly_stamp(&self, project: &str) -> Result<NightlyStamp> {
        Ok(self
            .stamps
            .read()
            .await
            .get(project)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_nightly_stamp(
        &self,
        project: &str,
        update: StampUpdate,
    ) -> Result<NightlyStamp> {
        let mut stamps = self.stamps.write().await;
        let stamp = stamps.entry(project.to_string()).or_default();
        stamp.apply(&update);
        Ok(stamp.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileStateStore {
        FileStateStore::new(Layout {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_file_store_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.poller_revision("alpha").await.unwrap(), None);
        assert_eq!(
            store.nightly_stamp("alpha").await.unwrap(),
            NightlyStamp::default()
        );
    }

    #[tokio::test]
    async fn test_file_store_persists_under_layout() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.set_poller_revision("alpha", "abc123").await.unwrap();
        let stamp = store
            .update_nightly_stamp("alpha", StampUpdate::Observed("abc123".to_string()))
            .await
            .unwrap();
        assert_eq!(stamp.observed.as_deref(), Some("abc123"));
        assert_eq!(stamp.fired, None);

        assert!(dir.path().join("pollers/alpha/state.json").exists());
        assert!(dir.path().join("triggers/nightly-alpha/stamp.json").exists());

        let reopened = FileStateStore::new(Layout {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        assert_eq!(
            reopened.poller_revision("alpha").await.unwrap().as_deref(),
            Some("abc123")
        );
        assert_eq!(reopened.nightly_stamp("alpha").await.unwrap(), stamp);
        assert_eq!(reopened.poller_revision("beta").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stamp_updates_from_two_stores_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let serving = store(&dir);
        let forced = store(&dir);

        for i in 0..10 {
            let (observed, fired) = tokio::join!(
                serving.update_nightly_stamp("alpha", StampUpdate::Observed(format!("r{i}"))),
                forced.update_nightly_stamp("alpha", StampUpdate::Fired(format!("f{i}"))),
            );
            observed.unwrap();
            fired.unwrap();
        }

        let stamp = store(&dir).nightly_stamp("alpha").await.unwrap();
        assert_eq!(stamp.observed.as_deref(), Some("r9"));
        assert_eq!(stamp.fired.as_deref(), Some("f9"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pollers/alpha");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("state.json"), "not json").unwrap();
        let err = store(&dir).poller_revision("alpha").await.unwrap_err();
        assert!(matches!(err, Error::StateStore(_)));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStateStore::new();
        store.set_poller_revision("alpha", "r1").await.unwrap();
        assert_eq!(
            store.poller_revision("alpha").await.unwrap(),
            Some("r1".to_string())
        );
        assert!(!store.nightly_stamp("alpha").await.unwrap().has_new_revision());
        let stamp = store
            .update_nightly_stamp("alpha", StampUpdate::Observed("r1".to_string()))
            .await
            .unwrap();
        assert!(stamp.has_new_revision());
        assert_eq!(store.nightly_stamp("alpha").await.unwrap(), stamp);
    }
}
