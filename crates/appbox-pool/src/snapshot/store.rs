use appbox_common::{Snapshot, SnapshotMetadata, SnapshotStore, StoreError, SNAPSHOT_VERSION};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::metadata_for;

const INDEX_FILE: &str = "index.json";

fn serialization(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

/// In-process store. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: RwLock<HashMap<String, (Snapshot, SnapshotMetadata)>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Overwrite an entry without touching its version, for exercising
    /// stale-schema handling.
    pub async fn insert_raw(&self, app_id: &str, snapshot: Snapshot) {
        let metadata = metadata_for(app_id, app_id, &snapshot);
        self.entries
            .write()
            .await
            .insert(app_id.to_string(), (snapshot, metadata));
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, app_id: &str) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .get(app_id)
            .map(|(snapshot, _)| snapshot.clone()))
    }

    async fn put(
        &self,
        app_id: &str,
        display_name: &str,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError> {
        let metadata = metadata_for(app_id, display_name, snapshot);
        self.entries
            .write()
            .await
            .insert(app_id.to_string(), (snapshot.clone(), metadata));
        Ok(())
    }

    async fn delete(&self, app_id: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(app_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SnapshotMetadata>, StoreError> {
        let mut list: Vec<SnapshotMetadata> = self
            .entries
            .read()
            .await
            .values()
            .map(|(_, meta)| meta.clone())
            .collect();
        list.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        Ok(list)
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    entries: BTreeMap<String, SnapshotMetadata>,
}

/// Directory-backed store: one JSON document per identifier plus an index of
/// metadata records so `list` never opens snapshot documents.
pub struct FsSnapshotStore {
    base_path: PathBuf,
    // Serializes read-modify-write cycles on the index.
    index_lock: Mutex<()>,
}

impl FsSnapshotStore {
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;
        Ok(Self {
            base_path,
            index_lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// File name for an identifier: a readable prefix plus a digest so distinct
    /// identifiers never collide after sanitizing.
    fn snapshot_path(&self, app_id: &str) -> PathBuf {
        let readable: String = app_id
            .chars()
            .take(48)
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let digest = format!("{:x}", Sha256::digest(app_id.as_bytes()));
        self.base_path
            .join(format!("{}-{}.json", readable, &digest[..12]))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&temp_path, data).await?;
        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn read_index(&self) -> Result<Index, StoreError> {
        match fs::read(self.base_path.join(INDEX_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(serialization),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Index::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(&self, index: &Index) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(index).map_err(serialization)?;
        Self::write_atomic(&self.base_path.join(INDEX_FILE), &bytes).await
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn get(&self, app_id: &str) -> Result<Option<Snapshot>, StoreError> {
        let bytes = match fs::read(self.snapshot_path(app_id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Check the schema version before trusting the rest of the document.
        let probe: VersionProbe = serde_json::from_slice(&bytes).map_err(serialization)?;
        if probe.version != SNAPSHOT_VERSION {
            debug!(app_id, version = probe.version, "Stored snapshot has a different schema version");
            return Ok(None);
        }

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(serialization)
    }

    async fn put(
        &self,
        app_id: &str,
        display_name: &str,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(snapshot).map_err(serialization)?;
        Self::write_atomic(&self.snapshot_path(app_id), &bytes).await?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        index.entries.insert(
            app_id.to_string(),
            metadata_for(app_id, display_name, snapshot),
        );
        self.write_index(&index).await
    }

    async fn delete(&self, app_id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.snapshot_path(app_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        if index.entries.remove(app_id).is_some() {
            self.write_index(&index).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SnapshotMetadata>, StoreError> {
        let _guard = self.index_lock.lock().await;
        match self.read_index().await {
            Ok(index) => Ok(index.entries.into_values().collect()),
            Err(StoreError::Serialization(e)) => {
                warn!(error = %e, "Snapshot index is corrupt, listing nothing");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appbox_common::SnapshotFile;
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample(version: u32) -> Snapshot {
        Snapshot {
            version,
            saved_at: Utc::now(),
            files: vec![SnapshotFile {
                path: "index.html".to_string(),
                content: "PGgxPmhpPC9oMT4=".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_fs_store_put_get_list_delete() {
        let temp_dir = tempdir().unwrap();
        let store = FsSnapshotStore::new(temp_dir.path()).await.unwrap();

        store.put("blog", "My Blog", &sample(SNAPSHOT_VERSION)).await.unwrap();
        store.put("shop/eu", "Shop", &sample(SNAPSHOT_VERSION)).await.unwrap();

        let loaded = store.get("blog").await.unwrap().unwrap();
        assert_eq!(loaded.files.len(), 1);

        let listing = store.list().await.unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].app_id, "blog");
        assert_eq!(listing[0].display_name, "My Blog");
        assert_eq!(listing[0].file_count, 1);
        assert_eq!(listing[0].total_size, 11);

        store.delete("blog").await.unwrap();
        assert!(store.get("blog").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);

        // Deleting twice is fine.
        store.delete("blog").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_store_stale_version_is_absent() {
        let temp_dir = tempdir().unwrap();
        let store = FsSnapshotStore::new(temp_dir.path()).await.unwrap();
        store.put("old", "Old", &sample(SNAPSHOT_VERSION + 7)).await.unwrap();
        assert!(store.get("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        {
            let store = FsSnapshotStore::new(temp_dir.path()).await.unwrap();
            store.put("notes", "Notes", &sample(SNAPSHOT_VERSION)).await.unwrap();
        }
        let reopened = FsSnapshotStore::new(temp_dir.path()).await.unwrap();
        assert!(reopened.get("notes").await.unwrap().is_some());
        assert_eq!(reopened.list().await.unwrap()[0].app_id, "notes");
    }

    #[tokio::test]
    async fn test_fs_store_corrupt_document_is_error() {
        let temp_dir = tempdir().unwrap();
        let store = FsSnapshotStore::new(temp_dir.path()).await.unwrap();
        fs::write(store.snapshot_path("bad"), b"{not json").await.unwrap();
        assert!(matches!(
            store.get("bad").await,
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_distinct_ids_never_share_a_file() {
        let store = FsSnapshotStore {
            base_path: PathBuf::from("/tmp/x"),
            index_lock: Mutex::new(()),
        };
        assert_ne!(store.snapshot_path("a/b"), store.snapshot_path("a_b"));
    }

    #[tokio::test]
    async fn test_memory_store_lists_sorted() {
        let store = MemorySnapshotStore::new();
        store.put("zeta", "Z", &sample(SNAPSHOT_VERSION)).await.unwrap();
        store.put("alpha", "A", &sample(SNAPSHOT_VERSION)).await.unwrap();
        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|m| m.app_id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert_eq!(store.len().await, 2);
    }
}
