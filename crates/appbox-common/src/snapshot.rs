use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Schema version stamped on every snapshot. A stored snapshot with any other
/// version is treated as absent.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub path: String,
    /// Base64 (standard alphabet, padded) file contents.
    pub content: String,
}

impl SnapshotFile {
    /// Decoded size computed from the base64 length, without decoding.
    pub fn decoded_len(&self) -> u64 {
        let len = self.content.len() as u64;
        let padding = self.content.bytes().rev().take_while(|b| *b == b'=').count() as u64;
        (len / 4 * 3).saturating_sub(padding)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub files: Vec<SnapshotFile>,
}

impl Snapshot {
    pub fn is_current(&self) -> bool {
        self.version == SNAPSHOT_VERSION
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(SnapshotFile::decoded_len).sum()
    }
}

/// Listing record; lets callers enumerate snapshots without loading file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub app_id: String,
    pub display_name: String,
    pub saved_at: DateTime<Utc>,
    pub file_count: usize,
    pub total_size: u64,
    pub content_hash: String,
}

/// Key-value persistence for snapshots. Single-key operations are atomic;
/// nothing is transactional across keys.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, app_id: &str) -> Result<Option<Snapshot>, StoreError>;

    async fn put(
        &self,
        app_id: &str,
        display_name: &str,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError>;

    async fn delete(&self, app_id: &str) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<SnapshotMetadata>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoded_len() {
        // "hello" -> "aGVsbG8="
        let file = SnapshotFile {
            path: "a.txt".to_string(),
            content: "aGVsbG8=".to_string(),
        };
        assert_eq!(file.decoded_len(), 5);

        let empty = SnapshotFile {
            path: "empty".to_string(),
            content: String::new(),
        };
        assert_eq!(empty.decoded_len(), 0);
    }

    #[test]
    fn test_version_check() {
        let mut snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            files: vec![],
        };
        assert!(snapshot.is_current());
        snapshot.version += 1;
        assert!(!snapshot.is_current());
    }
}
